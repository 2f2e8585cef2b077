//! Liveness reporting towards the external health checkers.
//!
//! Each pipeline process periodically announces its service name to the
//! configured checker addresses over UDP. The monitoring side lives outside
//! this crate; only the reporting half is provided here.
use std::io;
use std::net::UdpSocket;
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{debug, info, warn};

/// Interval between liveness announcements
const BEAT_INTERVAL: Duration = Duration::from_secs(1);

/// Handle to a running heartbeat reporter
pub struct HeartbeatHandle {
    stop: flume::Sender<()>,
    thread: JoinHandle<()>,
}

impl HeartbeatHandle {
    /// Signal the reporter to stop and wait for it to finish
    pub fn stop(self) {
        let _ = self.stop.send(());
        let _ = self.thread.join();
    }
}

/// Start reporting liveness for `service_name` to every checker address.
///
/// The returned handle cancels the reporter cooperatively; dropping it
/// without calling [HeartbeatHandle::stop] also stops the reporter, since
/// the signal channel disconnects.
pub fn start(checkers: Vec<String>, service_name: String) -> io::Result<HeartbeatHandle> {
    let socket = UdpSocket::bind("0.0.0.0:0")?;
    let (stop, stop_signal) = flume::bounded(1);
    let thread = std::thread::spawn(move || {
        info!(service = %service_name, checkers = checkers.len(), "heartbeat reporter started");
        loop {
            match stop_signal.recv_timeout(BEAT_INTERVAL) {
                Ok(()) | Err(flume::RecvTimeoutError::Disconnected) => {
                    info!(service = %service_name, "heartbeat reporter stopping");
                    return;
                }
                Err(flume::RecvTimeoutError::Timeout) => {}
            }
            for checker in &checkers {
                match socket.send_to(service_name.as_bytes(), checker.as_str()) {
                    Ok(_) => debug!(checker = %checker, "heartbeat sent"),
                    Err(error) => {
                        // the checker may simply be down, which is its problem
                        warn!(checker = %checker, %error, "failed to send heartbeat");
                    }
                }
            }
        }
    });
    Ok(HeartbeatHandle { stop, thread })
}
