pub mod connection;
pub mod header_download;
pub mod messages;
pub mod network;
pub mod peer;
pub mod synchronizer;
