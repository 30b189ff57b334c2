use std::net::IpAddr;
use std::path::{Path, PathBuf};

/// The most recent transfer in one direction, remembered to decide whether a later request may
///  resume it. Two requests are the same transfer if they have the same peer (IP address) and
///  the same file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRequest {
    pub peer: IpAddr,
    pub path: PathBuf,
    /// number of bytes of the file that were transferred so far
    pub progress: u64,
    pub successful: bool,
}

impl TransferRequest {
    pub fn new(peer: IpAddr, path: &Path) -> TransferRequest {
        TransferRequest {
            peer,
            path: path.to_path_buf(),
            progress: 0,
            successful: false,
        }
    }

    pub fn is_same_transfer(&self, peer: IpAddr, path: &Path) -> bool {
        self.peer == peer && self.path == path
    }

    /// an earlier request can be resumed if it is the same transfer and did not complete
    pub fn is_resumable_by(&self, peer: IpAddr, path: &Path) -> bool {
        self.is_same_transfer(peer, path) && !self.successful
    }
}
