//! A single-file BitTorrent downloader.
//!
//! [`torrent::Torrent`] loads metadata through the [`bencode`] codec,
//! [`tracker::Tracker`] finds peers, and [`scheduler::Scheduler`] drives one
//! [`peer::PeerSession`] per connection until every piece has been verified
//! and handed to an [`sink::OutputSink`].

pub mod bencode;
pub mod config;
pub mod error;
pub mod manager;
pub mod peer;
pub mod piece;
pub mod protocol;
pub mod scheduler;
pub mod sink;
pub mod torrent;
pub mod tracker;
