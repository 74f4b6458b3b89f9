use std::io;
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::device::{Device, DeviceHandle};
use crate::log_verbose;
use crate::logging::SharedLogger;
use crate::platform::ControlListener;

/// Run the accept loop on its own task.
///
/// Each accepted connection is served on a task of its own so a stalled
/// transaction never delays the next accept. The first accept failure is
/// reported through `errors` and ends the loop.
pub fn spawn<L, D>(
    listener: Arc<L>,
    device: Arc<DeviceHandle<D>>,
    errors: oneshot::Sender<io::Error>,
    logger: SharedLogger,
) -> JoinHandle<()>
where
    L: ControlListener,
    D: Device,
{
    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok(conn) => {
                    let device = device.clone();
                    tokio::spawn(async move {
                        device.handle_connection(conn).await;
                    });
                }
                Err(e) => {
                    log_verbose!(logger, "UAPI listener stopped: {}", e);
                    // The coordinator may already have stopped listening.
                    let _ = errors.send(e);
                    return;
                }
            }
        }
    })
}
