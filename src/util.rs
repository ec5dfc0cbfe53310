use anyhow::anyhow;
use sentry_core::protocol::SpanStatus;
use std::any::Any;
use std::future::Future;

/// Run `callback` inside a Sentry transaction named `transaction_name`.
///
/// The transaction is marked failed when the callback returns an error.
pub(crate) async fn with_sentry_transaction<F, R, E>(
    transaction_name: &str,
    callback: impl FnOnce() -> F,
) -> Result<R, E>
where
    F: Future<Output = Result<R, E>>,
{
    let tx_ctx = sentry_core::TransactionContext::new(transaction_name, "jobboss.perform");
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

/// Turn the payload of a caught panic into an error message.
pub(crate) fn try_to_extract_panic_info(info: &(dyn Any + Send + 'static)) -> anyhow::Error {
    if let Some(message) = info.downcast_ref::<&'static str>() {
        anyhow!("job panicked: {message}")
    } else if let Some(message) = info.downcast_ref::<String>() {
        anyhow!("job panicked: {message}")
    } else {
        anyhow!("job panicked")
    }
}
