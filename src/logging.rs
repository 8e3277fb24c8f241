use std::os::fd::RawFd;

use log::{debug, error, info, warn};

pub struct CadenceLogger;

impl CadenceLogger {
    pub fn unknown_config_key(key: &str, value: &toml::Value) {
        warn!("Unknown configuration '{key}' with value {value:?}");
    }

    pub fn tcp_nodelay_failed(err: &std::io::Error) {
        error!("Failed to set TCP_NODELAY: {err}");
    }

    pub fn session_connected(core: usize, fd: RawFd) {
        debug!("Session connected on core {core}, fd {fd}");
    }

    pub fn session_handed_off(core: usize, fd: RawFd) {
        debug!("Handed fd {fd} to the receiver (core {core})");
    }

    pub fn timer_overrun(core: usize, expirations: u64) {
        warn!("Timer expired more than once on core {core}: {expirations}");
    }

    pub fn shutting_down(fd: RawFd) {
        info!("Shutting down fd: {fd}");
    }

    pub fn connection_adopted(fd: RawFd) {
        debug!("Watching conn_fd: {fd}");
    }

    pub fn closing_conn(fd: RawFd) {
        info!("Closing conn_fd: {fd}");
    }

    pub fn closing_after_eof(fd: RawFd) {
        info!("Closing after EOF, conn_fd: {fd}");
    }

    pub fn pipe_closed() {
        warn!("Receiver: pipe closed - closing all connections ...");
    }

    pub fn sender_failed(core: usize, err: &anyhow::Error) {
        error!("Sender on core {core} failed: {err:#}");
    }

    pub fn receiver_failed(err: &anyhow::Error) {
        error!("Receiver failed: {err:#}");
    }
}
