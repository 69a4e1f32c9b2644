use crate::fleet::ServerId;
use crate::utils::threads::spawn_named_thread;
use std::io::{BufRead, BufReader, Read};
use std::thread::JoinHandle;
use tracing::{debug, warn};

/// Drains a subordinate's stderr on a named thread, re-emitting each line as
/// a tracing event tagged with the server id. Read errors end the drain and
/// are logged; they never become lifecycle events.
pub(crate) fn spawn_stderr_drain<R>(handle: R, server: ServerId) -> JoinHandle<()>
where
    R: Read + Send + 'static,
{
    spawn_named_thread(format!("{server} stderr drain"), move || {
        for line in BufReader::new(handle).lines() {
            match line {
                Ok(line) => debug!(%server, "{line}"),
                Err(err) => {
                    warn!(%server, %err, "stopped reading subordinate stderr");
                    break;
                }
            }
        }
    })
}
