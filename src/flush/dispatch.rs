//! Request Dispatcher
//!
//! Moves queued pool requests onto the transport, one task per request, and
//! applies replies (solicited or pushed by the transport) to the core.

use super::control::{DispatchInputs, FlushControl};
use crate::domain::ports::TransportRef;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Spawn the dispatcher task. It runs until `cancel` fires.
pub(crate) fn spawn_dispatcher(
    control: Arc<FlushControl>,
    transport: TransportRef,
    inputs: DispatchInputs,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    let DispatchInputs {
        mut requests,
        mut replies,
    } = inputs;

    tokio::spawn(async move {
        info!(transport = transport.name(), "Request dispatcher started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                Some(request) = requests.recv() => {
                    let control = control.clone();
                    let transport = transport.clone();
                    tokio::spawn(async move {
                        match transport.send(&request.address, request.command.clone()).await {
                            Ok(reply) => {
                                if let Err(e) = control.handle_request_reply(&request, reply) {
                                    debug!(pool = %request.pool, error = %e, "Reply not applied");
                                }
                            }
                            Err(e) => control.handle_request_failure(&request, &e),
                        }
                    });
                }
                Some(reply) = replies.recv() => {
                    if let Err(e) = control.handle_reply(reply) {
                        debug!(error = %e, "Unsolicited reply not applied");
                    }
                }
                else => break,
            }
        }
        info!("Request dispatcher stopped");
    })
}
