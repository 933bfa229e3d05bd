use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::scenario::{FlockUser, Task, UserBehavior, UserSpec};

/// Commands sent from the engine to a running user.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum UserCommand {
    /// Finish the current task, run the on_stop tasks and exit.
    Exit,
}

// How long a user with nothing runnable waits before checking for work again.
const IDLE_WAIT: Duration = Duration::from_millis(500);

pub(crate) async fn user_main(
    user_spec: Arc<UserSpec>,
    mut user: FlockUser,
    receiver: flume::Receiver<UserCommand>,
    cursor: Arc<AtomicUsize>,
    log_prefix: String,
) {
    info!(
        "{}launching user {} from {}...",
        log_prefix, user.user_id, user_spec.name
    );

    // User is starting, first invoke the weighted on_start tasks.
    for task_index in &user_spec.weighted_on_start_tasks {
        debug!(
            "[user {}]: launching on_start task {} from {}",
            user.user_id, task_index, user_spec.name
        );
        invoke_task(&user_spec, *task_index, &mut user).await;
    }

    // Loop launching tasks until the engine tells us to stop.
    let mut position = 0;
    loop {
        if received_exit(&receiver) {
            break;
        }

        match user_spec.select_next_task(&mut position) {
            Some(task_index) => {
                cursor.store(task_index, Ordering::Relaxed);
                debug!(
                    "[user {}]: launching task {} from {}",
                    user.user_id, task_index, user_spec.name
                );
                invoke_task(&user_spec, task_index, &mut user).await;
            }
            None => {
                // Nothing to run, keep the slot until told to exit.
                if wait_or_exit(&receiver, IDLE_WAIT).await {
                    break;
                }
                continue;
            }
        }

        let wait_time = user_spec.get_wait_time();
        if wait_or_exit(&receiver, wait_time).await {
            break;
        }
    }

    // User is exiting, first invoke the weighted on_stop tasks.
    for task_index in &user_spec.weighted_on_stop_tasks {
        debug!(
            "[user {}]: launching on_stop task {} from {}",
            user.user_id, task_index, user_spec.name
        );
        invoke_task(&user_spec, *task_index, &mut user).await;
    }

    info!(
        "{}exiting user {} from {}...",
        log_prefix, user.user_id, user_spec.name
    );
}

// Returns true if the engine asked this user to exit, or went away.
fn received_exit(receiver: &flume::Receiver<UserCommand>) -> bool {
    match receiver.try_recv() {
        Ok(UserCommand::Exit) => true,
        Err(flume::TryRecvError::Disconnected) => true,
        Err(flume::TryRecvError::Empty) => false,
    }
}

// Sleep for `wait_time`, waking early if told to exit. Returns true on exit.
async fn wait_or_exit(receiver: &flume::Receiver<UserCommand>, wait_time: Duration) -> bool {
    if wait_time.as_nanos() == 0 {
        // Still yield so a user with no wait time doesn't starve the runtime.
        tokio::task::yield_now().await;
        return received_exit(receiver);
    }
    tokio::select! {
        command = receiver.recv_async() => {
            // Disconnected means the engine is gone.
            matches!(command, Ok(UserCommand::Exit) | Err(_))
        }
        _ = tokio::time::sleep(wait_time) => false,
    }
}

// Run one task, catching errors and panics so the user loop continues.
async fn invoke_task(user_spec: &UserSpec, task_index: usize, user: &mut FlockUser) {
    let task = &user_spec.tasks[task_index];
    let location = format!("{}: {}", user_spec.name, task.display_name());
    run_task(&location, task, user).await;
}

/// Run a `test_start` or `test_stop` task with a dedicated user.
pub(crate) async fn invoke_hook(hook: &str, task: &Task, user: &mut FlockUser) {
    info!("running {} task...", hook);
    run_task(hook, task, user).await;
}

async fn run_task(location: &str, task: &Task, user: &mut FlockUser) {
    let function = task.function;
    let error = match AssertUnwindSafe(function(user)).catch_unwind().await {
        Ok(Ok(())) => None,
        Ok(Err(e)) => Some(e.message),
        Err(panic) => Some(panic_message(panic)),
    };
    if let Some(error) = error {
        debug!("[user {}]: {} failed: {}", user.user_id, location, error);
        user.report_exception(location, &error);
    }
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        format!("panicked at '{}'", message)
    } else if let Some(message) = panic.downcast_ref::<String>() {
        format!("panicked at '{}'", message)
    } else {
        "panicked".to_string()
    }
}
