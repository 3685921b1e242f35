pub mod helpers;
pub mod imap_client;
