use std::sync::Arc;

use tokio::sync::mpsc;

use crate::infrastructure::monitor::{
    EventKind, TaskEvent, TaskId, TaskMonitor, TaskSnapshot, TaskStatus,
};

/// Live status channel for one task: yields the current state immediately,
/// then every subsequent event up to and including the terminal one, after
/// which the channel closes and the listener is unregistered.
pub fn stream_task_events(
    monitor: Arc<dyn TaskMonitor>,
    task_id: TaskId,
) -> mpsc::UnboundedReceiver<TaskEvent> {
    let (out_tx, out_rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let listener = monitor.add_listener(task_id, tx).await;

        match monitor.get_task_status(task_id).await {
            Ok(Some(snapshot)) => {
                let terminal = snapshot.status.is_terminal();
                if out_tx.send(snapshot_event(&snapshot)).is_err() || terminal {
                    monitor.remove_listener(task_id, listener).await;
                    return;
                }
            }
            Ok(None) => {
                // Unknown yet: the task may register after the subscriber.
            }
            Err(err) => {
                tracing::error!(task_id, error = %err, "failed to read task snapshot");
            }
        }

        while let Some(event) = rx.recv().await {
            let terminal = event.event.is_terminal();
            if out_tx.send(event).is_err() || terminal {
                break;
            }
        }
        monitor.remove_listener(task_id, listener).await;
    });

    out_rx
}

fn snapshot_event(snapshot: &TaskSnapshot) -> TaskEvent {
    let event = match snapshot.status {
        TaskStatus::Completed => EventKind::Completed,
        TaskStatus::Failed => EventKind::Failed,
        TaskStatus::TimedOut => EventKind::Timeout,
        TaskStatus::Pending | TaskStatus::Processing => EventKind::Stage,
    };
    TaskEvent {
        event,
        task_id: snapshot.task_id,
        status: snapshot.status,
        stage: snapshot.stage.clone(),
        audio_url: snapshot.audio_url.clone(),
        filename: snapshot.filename.clone(),
        error_message: snapshot.error_message.clone(),
        duration_secs: snapshot.duration_secs,
    }
}
