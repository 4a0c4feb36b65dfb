//! EOD trigger consumer.
//!
//! One dispatcher task reads `EOD_TRIGGER` records one at a time and fans
//! account runs out over a bounded worker pool. Failures are routed to the
//! DLQ by error kind; a trigger refused for shutdown is deferred rather than
//! failed so a restart picks it back up.

use plk_fabric::{BusMessage, DlqWriter, DrainState, MessageBus};
use plk_schemas::{EodTrigger, LoaderError, Topic};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

/// Deferral for work refused because of shutdown or lock contention.
const DEFER_RETRY: Duration = Duration::from_secs(30);

/// Poll granularity for noticing shutdown while idle.
const IDLE_POLL: Duration = Duration::from_secs(1);

pub async fn run_eod_consumer(
    pipeline: Arc<super::EodPipeline>,
    bus: MessageBus,
    dlq: DlqWriter,
    drain: DrainState,
    workers: usize,
) {
    let mut rx = bus.subscribe(Topic::EodTrigger.as_str());
    let semaphore = Arc::new(Semaphore::new(workers.max(1)));
    let mut tasks: JoinSet<()> = JoinSet::new();

    tracing::info!(workers, "eod consumer started");

    loop {
        if drain.is_shutting_down() {
            break;
        }

        let msg = match tokio::time::timeout(IDLE_POLL, rx.recv()).await {
            Ok(Some(msg)) => msg,
            Ok(None) => break, // bus gone
            Err(_) => continue,
        };

        // Reap finished workers without blocking.
        while tasks.try_join_next().is_some() {}

        let permit = match Arc::clone(&semaphore).acquire_owned().await {
            Ok(p) => p,
            Err(_) => break,
        };

        let pipeline = Arc::clone(&pipeline);
        let dlq = dlq.clone();
        tasks.spawn(async move {
            let _permit = permit;
            process_trigger(&pipeline, &dlq, msg).await;
        });
    }

    // Let in-flight runs finish; the drain timeout in the daemon bounds this.
    while tasks.join_next().await.is_some() {}
    tracing::info!("eod consumer stopped");
}

async fn process_trigger(pipeline: &super::EodPipeline, dlq: &DlqWriter, msg: BusMessage) {
    let trigger: EodTrigger = match serde_json::from_value(msg.payload.clone()) {
        Ok(t) => t,
        Err(e) => {
            let err = LoaderError::Malformed(format!("EOD trigger did not parse: {e}"));
            if let Err(park_err) = dlq
                .park(Topic::EodTrigger.as_str(), &msg.key, msg.payload, &err)
                .await
            {
                tracing::error!(error = %park_err, "failed to park malformed trigger");
            }
            return;
        }
    };

    match pipeline.run(&trigger).await {
        Ok(outcome) => {
            tracing::debug!(account_id = trigger.account_id, ?outcome, "eod trigger processed");
        }
        Err(err) => route_failure(dlq, &msg, &err).await,
    }
}

async fn route_failure(dlq: &DlqWriter, msg: &BusMessage, err: &LoaderError) {
    let result = match err {
        // Shutdown and lock contention are deferrals, not failures.
        LoaderError::ShuttingDown | LoaderError::LockUnavailable { .. } => {
            dlq.park_deferred(
                Topic::EodTrigger.as_str(),
                &msg.key,
                msg.payload.clone(),
                err,
                DEFER_RETRY,
            )
            .await
        }
        _ => {
            dlq.park(
                Topic::EodTrigger.as_str(),
                &msg.key,
                msg.payload.clone(),
                err,
            )
            .await
        }
    };

    if let Err(park_err) = result {
        tracing::error!(key = %msg.key, error = %park_err, "failed to park EOD trigger in DLQ");
    }
}
