use super::orchestrator::FallbackOrchestrator;
use super::state::{FallbackEvent, FallbackMode, FallbackStatus};
use crate::application::flow::events::{Command, FlowNotice};
use crate::application::flow::runtime::FlowHandle;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Connects one flow to the orchestrator.
///
/// Flow failures and completions are reported to the orchestrator; the
/// orchestrator's decisions for this flow come back as fallback commands.
/// The task ends when the flow actor stops.
pub fn attach(flow: FlowHandle, orchestrator: FallbackOrchestrator) -> JoinHandle<()> {
    let mut notices = flow.notices();
    let mut decisions = orchestrator.subscribe();
    let mut snapshots = flow.subscribe();

    tokio::spawn(async move {
        loop {
            tokio::select! {
                notice = notices.recv() => match notice {
                    Ok(notice) => on_notice(&orchestrator, notice),
                    Err(RecvError::Lagged(skipped)) => warn!(skipped, "flow notices lagged"),
                    Err(RecvError::Closed) => break,
                },
                decision = decisions.recv() => match decision {
                    Ok(event) if event.flow_id() == flow.flow_id() => {
                        if let Some(command) = to_command(&orchestrator, event) {
                            if flow.send(command).is_err() {
                                break;
                            }
                        }
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => warn!(skipped, "fallback events lagged"),
                    Err(RecvError::Closed) => break,
                },
                changed = snapshots.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        debug!(flow_id = flow.flow_id(), "fallback bridge stopped");
    })
}

fn on_notice(orchestrator: &FallbackOrchestrator, notice: FlowNotice) {
    match notice {
        FlowNotice::Failed {
            flow_id,
            provider,
            error,
            request: Some(request),
        } => {
            let state = orchestrator.state(&flow_id);
            let executing = state.pending_event.is_none()
                && matches!(state.status, FallbackStatus::Executing | FallbackStatus::AutoExecuting);
            if executing {
                orchestrator.notify_failure(&flow_id, &provider, &error, &request, true);
            } else {
                orchestrator.report_failure(&flow_id, &provider, &error, &request, false);
            }
        }
        FlowNotice::Failed { flow_id, .. } => {
            debug!(flow_id = %flow_id, "failure without request, fallback skipped");
        }
        FlowNotice::Completed { flow_id, provider, .. } => {
            let status = orchestrator.state(&flow_id).status;
            if matches!(status, FallbackStatus::Executing | FallbackStatus::AutoExecuting) {
                orchestrator.notify_success(&flow_id, &provider);
            }
        }
    }
}

/// The orchestrator drives timing, so the flow always waits in manual mode.
fn to_command(orchestrator: &FallbackOrchestrator, event: FallbackEvent) -> Option<Command> {
    match event {
        FallbackEvent::Available { event, .. } => Some(Command::FallbackRequested {
            failed_provider_id: event.failed_provider,
            request: event.original_request,
            mode: Some(FallbackMode::Manual),
        }),
        FallbackEvent::AutoStarted {
            flow_id, from_provider, ..
        } => {
            let pending = orchestrator.state(&flow_id).pending_event?;
            Some(Command::FallbackRequested {
                failed_provider_id: from_provider,
                request: pending.original_request,
                mode: Some(FallbackMode::Manual),
            })
        }
        FallbackEvent::Execute { provider, request, .. } => Some(Command::FallbackExecute {
            provider_id: provider,
            request,
        }),
        FallbackEvent::Cancelled { .. } | FallbackEvent::Exhausted { .. } => Some(Command::FallbackAbort),
        FallbackEvent::Completed { .. } => None,
    }
}
