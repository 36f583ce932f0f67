use anyhow::anyhow;
use sentry_core::protocol::SpanStatus;
use std::any::Any;
use std::future::Future;

/// Runs `callback` inside a Sentry performance transaction named after the job class.
pub(crate) async fn with_sentry_transaction<F, Fut, R, E>(
    transaction_name: &str,
    callback: F,
) -> Result<R, E>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<R, E>>,
{
    let tx_ctx = sentry_core::TransactionContext::new(transaction_name, "batched_migration.perform");
    let tx = sentry_core::start_transaction(tx_ctx);

    let result = callback().await;

    tx.set_status(if result.is_ok() {
        SpanStatus::Ok
    } else {
        SpanStatus::UnknownError
    });
    tx.finish();

    result
}

/// Turns a panic payload into an error that can be stored on the batch.
pub(crate) fn try_to_extract_panic_info(info: &(dyn Any + Send + 'static)) -> anyhow::Error {
    if let Some(message) = info.downcast_ref::<&'static str>() {
        anyhow!("batch panicked: {message}")
    } else if let Some(message) = info.downcast_ref::<String>() {
        anyhow!("batch panicked: {message}")
    } else {
        anyhow!("batch panicked")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn panic_messages_are_kept() {
        let payload: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(try_to_extract_panic_info(&*payload).to_string(), "batch panicked: boom");

        let payload: Box<dyn Any + Send> = Box::new(String::from("kaboom"));
        assert_eq!(try_to_extract_panic_info(&*payload).to_string(), "batch panicked: kaboom");

        let payload: Box<dyn Any + Send> = Box::new(42);
        assert_eq!(try_to_extract_panic_info(&*payload).to_string(), "batch panicked");
    }
}
