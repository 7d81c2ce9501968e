//! Sync adapter error types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("sync adapter is not enabled")]
    NotEnabled,

    #[error("no Diretta targets found")]
    NoTargets,

    #[error("target index {index} out of range ({count} target(s) found)")]
    TargetIndexOutOfRange { index: usize, count: usize },

    #[error("SDK open failed after {attempts} attempt(s)")]
    SdkOpenFailed { attempts: u32 },

    #[error("setSink failed after {attempts} attempt(s)")]
    SetSinkFailed { attempts: u32 },

    #[error("no supported PCM format for {rate}Hz/{channels}ch")]
    NoSupportedPcmFormat { rate: u32, channels: u32 },

    #[error("no supported DSD format for {rate}Hz/{channels}ch")]
    NoSupportedDsdFormat { rate: u32, channels: u32 },

    #[error("connectPrepare failed")]
    ConnectPrepareFailed,

    #[error("connect failed after {attempts} attempt(s)")]
    ConnectFailed { attempts: u32 },

    #[error("connectWait failed")]
    ConnectWaitFailed,
}

pub type SyncResult<T> = Result<T, SyncError>;
