use std::sync::Arc;

use {
    anyhow::Result,
    clap::Subcommand,
    wagate_config::Layout,
    wagate_queue::HistorySyncQueue,
    wagate_store::{SqliteAccountStore, SqliteMessageStore},
    wagate_whatsapp::HistorySyncWorker,
};

#[derive(Subcommand)]
pub enum QueueAction {
    /// Number of pending history sync items.
    Len,
    /// Apply every pending item now, then exit.
    ///
    /// The queue database is locked by a running gateway; stop it first.
    Drain,
}

pub async fn handle_queue(action: QueueAction, layout: &Layout, queue_name: &str) -> Result<()> {
    let queue = HistorySyncQueue::open(&layout.queue_dir, queue_name)?;
    match action {
        QueueAction::Len => {
            println!("{}", queue.len().await?);
            Ok(())
        },
        QueueAction::Drain => {
            let pool = wagate_store::open(&layout.database_url).await?;
            let worker = HistorySyncWorker::new(
                queue,
                Arc::new(SqliteAccountStore::new(pool.clone())),
                Arc::new(SqliteMessageStore::new(pool)),
            );
            let handled = worker.drain().await;
            println!("Processed {handled} item(s).");
            Ok(())
        },
    }
}

#[cfg(test)]
mod tests {
    use {wagate_config::WagateConfig, wagate_queue::HistorySyncItem};

    use super::*;

    #[tokio::test]
    async fn drain_empties_the_queue() {
        let tmp = tempfile::tempdir().unwrap();
        let config = WagateConfig::default();
        let layout = Layout::under(&config, tmp.path());
        {
            let queue = HistorySyncQueue::open(&layout.queue_dir, &config.queue.name).unwrap();
            queue
                .push(&HistorySyncItem::new("t1", b"{}".to_vec()))
                .await
                .unwrap();
        }

        handle_queue(QueueAction::Drain, &layout, &config.queue.name)
            .await
            .unwrap();

        let queue = HistorySyncQueue::open(&layout.queue_dir, &config.queue.name).unwrap();
        assert!(queue.is_empty().await.unwrap());
    }
}
