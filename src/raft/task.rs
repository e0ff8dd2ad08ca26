use std::any::Any;
use std::future::Future;

use log::{debug, error};
use tokio::task::JoinHandle;

/// Spawns `fut` on its own task and logs a panic instead of propagating it.
pub fn spawn_contained<F>(name: &'static str, fut: F) -> JoinHandle<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let inner = tokio::spawn(fut);
    tokio::spawn(async move {
        match inner.await {
            Ok(()) => {}
            Err(e) if e.is_panic() => {
                error!("{name} task panicked: {}", panic_message(&*e.into_panic()));
            }
            Err(_) => debug!("{name} task was cancelled"),
        }
    })
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn panic_is_contained() {
        let handle = spawn_contained("test", async {
            panic!("boom");
        });
        assert!(handle.await.is_ok());
    }

    #[test]
    fn panic_message_reads_common_payloads() {
        let s: Box<dyn Any + Send> = Box::new("static");
        assert_eq!(panic_message(&*s), "static");
        let s: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(&*s), "owned");
        let s: Box<dyn Any + Send> = Box::new(7u8);
        assert_eq!(panic_message(&*s), "non-string panic payload");
    }
}
