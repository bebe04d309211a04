//! Shared protocol constants for the Got framed transport

// Protocol header constants
pub const MAGIC: &[u8; 4] = b"GOT1";
pub const VERSION: u16 = 1;

// Maximum frame payload size (1MB). Chunks never exceed CHUNK_SIZE; the
// cap only bounds metadata and listing replies.
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

// Largest data chunk sent in one DATA frame
pub const CHUNK_SIZE: usize = 4 * 1024;

// Port used when an address carries none
pub const DEFAULT_PORT: u16 = 9876;

// Segments in a rendered progress bar
pub const BAR_WIDTH: usize = 16;

// Frame type IDs
pub mod frame {
    // Client -> server: method u8 | metadata
    pub const CALL: u8 = 1;
    // Either direction: one message of raw bytes
    pub const DATA: u8 = 2;
    // Client -> server: no more request messages
    pub const END: u8 = 3;
    // Server -> client: response metadata, precedes any response DATA
    pub const HEADER: u8 = 4;
    // Server -> client: code u8 | message, terminates the call
    pub const STATUS: u8 = 5;
}

// Remote operations
pub mod method {
    pub const LIST: u8 = 1;
    pub const CHDIR: u8 = 2;
    pub const UPLOAD: u8 = 3;
    pub const DOWNLOAD: u8 = 4;

    pub fn name(m: u8) -> &'static str {
        match m {
            LIST => "ListFile",
            CHDIR => "ChangeDir",
            UPLOAD => "UploadFile",
            DOWNLOAD => "DownloadFile",
            _ => "Unknown",
        }
    }
}

// STATUS frame codes
pub mod status {
    pub const OK: u8 = 0;
    pub const IO: u8 = 1;
    pub const NOT_FOUND: u8 = 2;
    pub const PROTOCOL: u8 = 3;
}

// Out-of-band metadata keys and values
pub mod keys {
    pub const PATH: &str = "path";
    pub const NAME: &str = "name";
    pub const TYPE: &str = "type";
    pub const SIZE: &str = "size";
    pub const ERROR: &str = "error";
    pub const OK: &str = "ok";

    pub const TYPE_FILE: &str = "file";
    pub const TYPE_DIR: &str = "dir";
}

pub mod timeouts {
    // Connection establishment timeout (ms)
    pub const CONNECT_MS: u64 = 5_000;
}
