use std::any::{type_name, Any};
use std::future::Future;

use tracing::error;

fn get_type_name<T>(_: &T) -> &'static str {
    type_name::<T>()
}

/// Best-effort extraction of a panic payload as text.
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        format!("unknown panic type: {}", get_type_name(&payload))
    }
}

/// Spawn a task whose panic is caught and logged instead of being lost
/// with the task handle. Used for every fire-and-forget task so a panic
/// never silently kills a connection or a reconnect loop.
pub fn spawn_logged<F>(name: &'static str, fut: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    let handle = tokio::spawn(fut);
    tokio::spawn(async move {
        if let Err(join_error) = handle.await {
            if join_error.is_panic() {
                let payload = join_error.into_panic();
                error!("task {} panicked: {}", name, panic_message(payload.as_ref()));
            }
        }
    });
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_panic_message_extracts_str_and_string() {
        let boxed: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(boxed.as_ref()), "boom");

        let boxed: Box<dyn Any + Send> = Box::new("dynamic".to_string());
        assert_eq!(panic_message(boxed.as_ref()), "dynamic");

        let boxed: Box<dyn Any + Send> = Box::new(42_u64);
        assert!(panic_message(boxed.as_ref()).contains("unknown panic type"));
    }

    #[tokio::test]
    async fn test_spawn_logged_survives_panic() {
        spawn_logged("exploding task", async {
            panic!("intentional");
        });
        // give the watcher a chance to run; the test passes if the
        // runtime itself is still alive afterwards
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    }
}
