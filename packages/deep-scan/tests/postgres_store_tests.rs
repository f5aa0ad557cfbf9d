//! PostgresStore tests against a real database.
//!
//! Require Docker. Run with: cargo test -p deep-scan --test postgres_store_tests -- --ignored

mod common;

use anyhow::{Context, Result};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, ImageExt};
use testcontainers_modules::postgres::Postgres;
use tokio::sync::OnceCell;
use uuid::Uuid;

use common::{connection, ids, receipt};
use deep_scan::testing::{MockAi, MockConnector, MockMailbox};
use deep_scan::types::document::{DocumentSource, DocumentStatus, Enrichment, NewDocument};
use deep_scan::types::job::CounterDelta;
use deep_scan::types::queue::ItemOutcome;
use deep_scan::{
    DocumentStore, MailboxConnection, MailboxStore, PostgresStore, QueueItemStatus, ScanConfig,
    ScanControl, ScanDeps, ScanError, ScanJob, ScanJobStore, ScanOrchestrator, ScanQueueStore,
    ScanStatus, TimeBudget,
};

/// One Postgres container shared by every test in this file.
struct SharedDb {
    db_url: String,
    _postgres: ContainerAsync<Postgres>,
}

static SHARED_DB: OnceCell<SharedDb> = OnceCell::const_new();

impl SharedDb {
    async fn init() -> Result<Self> {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();

        let postgres = Postgres::default()
            .with_tag("16")
            .start()
            .await
            .context("Failed to start Postgres container")?;

        let host = postgres.get_host().await?;
        let port = postgres.get_host_port_ipv4(5432).await?;
        let db_url = format!("postgresql://postgres:postgres@{}:{}/postgres", host, port);

        PostgresStore::new(&db_url)
            .await
            .context("Failed to connect to Postgres for migrations")?
            .migrate()
            .await
            .context("Failed to run migrations")?;

        Ok(Self {
            db_url,
            _postgres: postgres,
        })
    }
}

async fn store() -> PostgresStore {
    let shared = SHARED_DB
        .get_or_try_init(SharedDb::init)
        .await
        .expect("shared database");
    PostgresStore::new(&shared.db_url).await.expect("connect")
}

/// A fresh mailbox row; every test works in its own account.
async fn mailbox(store: &PostgresStore) -> MailboxConnection {
    let mailbox = connection();
    store.upsert_mailbox(&mailbox).await.unwrap();
    mailbox
}

async fn job(store: &PostgresStore, mailbox: &MailboxConnection) -> ScanJob {
    store
        .create_job(&ScanJob::for_mailbox(
            mailbox.account_id,
            mailbox.id,
            "invoice",
        ))
        .await
        .unwrap()
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_one_active_job_per_mailbox() {
    let store = store().await;
    let mailbox = mailbox(&store).await;
    let first = job(&store, &mailbox).await;

    let err = store
        .create_job(&ScanJob::for_mailbox(mailbox.account_id, mailbox.id, "invoice"))
        .await
        .unwrap_err();
    assert!(matches!(err, ScanError::ActiveScanExists { job_id } if job_id == first.id));

    store.fail_job(first.id, "token revoked").await.unwrap();
    let second = job(&store, &mailbox).await;
    assert_ne!(second.id, first.id);
    assert_eq!(
        store.find_active_job(mailbox.id).await.unwrap().unwrap().id,
        second.id
    );
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_transition_is_conditional() {
    let store = store().await;
    let mailbox = mailbox(&store).await;
    let job = job(&store, &mailbox).await;

    assert!(store
        .transition(job.id, ScanStatus::Discovering, ScanStatus::Processing)
        .await
        .unwrap());
    assert!(!store
        .transition(job.id, ScanStatus::Discovering, ScanStatus::Processing)
        .await
        .unwrap());

    assert!(store
        .transition(job.id, ScanStatus::Processing, ScanStatus::Completed)
        .await
        .unwrap());
    let completed = store.get_job(job.id).await.unwrap().unwrap();
    assert!(completed.completed_at.is_some());
    assert!(!store.fail_job(job.id, "late").await.unwrap());
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_enqueue_and_discovery_checkpoints() {
    let store = store().await;
    let mailbox = mailbox(&store).await;
    let job = job(&store, &mailbox).await;

    let first = ["a", "b", "c"].map(String::from);
    let second = ["b", "c", "d"].map(String::from);
    assert_eq!(store.enqueue_messages(job.id, &first).await.unwrap(), 3);
    store.save_discovery_page(job.id, Some("page-1")).await.unwrap();

    // Re-listing a page enqueued by an interrupted call leaves the total intact
    assert_eq!(store.enqueue_messages(job.id, &first).await.unwrap(), 0);
    store.save_discovery_page(job.id, Some("page-1")).await.unwrap();
    let saved = store.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(saved.total_discovered, 3);
    assert_eq!(saved.page_token.as_deref(), Some("page-1"));

    assert_eq!(store.enqueue_messages(job.id, &second).await.unwrap(), 1);
    store.save_discovery_page(job.id, None).await.unwrap();

    let finished = store.finish_discovery(job.id).await.unwrap();
    assert_eq!(finished.total_discovered, 4);
    assert_eq!(finished.total_to_process, 4);
    assert!(finished.page_token.is_none());
    assert!(finished.discovery_finished());

    let counts = store.queue_counts(job.id).await.unwrap();
    assert_eq!(counts.total, 4);
    assert_eq!(counts.pending, 4);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ignore = "requires Docker"]
async fn test_concurrent_claims_are_disjoint() {
    let store = Arc::new(store().await);
    let mailbox = mailbox(&store).await;
    let job = job(&store, &mailbox).await;
    store
        .enqueue_messages(job.id, &ids("m", 0..200))
        .await
        .unwrap();

    let workers: Vec<_> = (0..6)
        .map(|_| {
            let store = store.clone();
            let job_id = job.id;
            tokio::spawn(async move {
                let mut claimed = Vec::new();
                loop {
                    let batch = store
                        .claim_pending(job_id, 15, Duration::from_secs(600))
                        .await
                        .unwrap();
                    if batch.is_empty() {
                        return claimed;
                    }
                    claimed.extend(batch.into_iter().map(|item| item.id));
                }
            })
        })
        .collect();

    let mut seen = HashSet::new();
    for worker in workers {
        for id in worker.await.unwrap() {
            assert!(seen.insert(id), "item {} claimed twice", id);
        }
    }
    assert_eq!(seen.len(), 200);

    let counts = store.queue_counts(job.id).await.unwrap();
    assert_eq!(counts.pending, 0);
    assert_eq!(counts.processing, 200);
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_stale_claims_are_reclaimed_and_released() {
    let store = store().await;
    let mailbox = mailbox(&store).await;
    let job = job(&store, &mailbox).await;
    store
        .enqueue_messages(job.id, &ids("m", 0..4))
        .await
        .unwrap();

    let claimed = store
        .claim_pending(job.id, 10, Duration::from_secs(600))
        .await
        .unwrap();
    assert_eq!(claimed.len(), 4);

    // Within the lease nothing is reclaimable
    assert!(store
        .claim_pending(job.id, 10, Duration::from_secs(600))
        .await
        .unwrap()
        .is_empty());

    let reclaimed = store
        .claim_pending(job.id, 10, Duration::ZERO)
        .await
        .unwrap();
    assert_eq!(reclaimed.len(), 4);
    assert!(reclaimed.iter().all(|item| item.version == 2));

    // The superseded claim can neither complete nor release its items
    let delta = CounterDelta {
        processed: 1,
        skipped: 1,
        ..Default::default()
    };
    assert!(!store
        .complete_item(&claimed[0], &ItemOutcome::Skipped, &delta)
        .await
        .unwrap());
    assert_eq!(
        store
            .release_items(&claimed, QueueItemStatus::Pending)
            .await
            .unwrap(),
        0
    );
    assert_eq!(
        store.get_job(job.id).await.unwrap().unwrap().processed_count,
        0
    );

    assert_eq!(
        store
            .release_items(&reclaimed[2..], QueueItemStatus::Pending)
            .await
            .unwrap(),
        2
    );
    let counts = store.queue_counts(job.id).await.unwrap();
    assert_eq!(counts.pending, 2);
    assert_eq!(counts.processing, 2);
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_ai_claims_only_flagged_items() {
    let store = store().await;
    let mailbox = mailbox(&store).await;
    let job = job(&store, &mailbox).await;
    store
        .enqueue_messages(job.id, &ids("m", 0..2))
        .await
        .unwrap();

    let items = store
        .claim_pending(job.id, 10, Duration::from_secs(600))
        .await
        .unwrap();
    for (idx, item) in items.iter().enumerate() {
        let document = store
            .insert_document(
                NewDocument::builder()
                    .account_id(mailbox.account_id)
                    .mailbox_id(mailbox.id)
                    .source_message_id(item.message_id.clone())
                    .build(),
            )
            .await
            .unwrap()
            .unwrap();
        let outcome = ItemOutcome::RegexDone {
            document_id: document.id,
            needs_ai: idx == 0,
        };
        let delta = CounterDelta {
            processed: 1,
            created: 1,
            ai_total: i32::from(idx == 0),
            ..Default::default()
        };
        assert!(store.complete_item(item, &outcome, &delta).await.unwrap());
        // A completed item is no longer claimed
        assert!(!store.complete_item(item, &outcome, &delta).await.unwrap());
    }

    let counted = store.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(counted.processed_count, 2);
    assert_eq!(counted.documents_created, 2);
    assert_eq!(counted.ai_total, 1);

    let counts = store.queue_counts(job.id).await.unwrap();
    assert_eq!(counts.regex_done_needing_ai, 1);
    assert!(counts.regex_drained());

    let ai_items = store
        .claim_for_ai(job.id, 5, Duration::from_secs(600))
        .await
        .unwrap();
    assert_eq!(ai_items.len(), 1);
    assert_eq!(ai_items[0].status, QueueItemStatus::AiProcessing);
    assert!(ai_items[0].needs_ai);
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_documents_are_unique_per_message_and_feed_consensus() {
    let store = store().await;
    let mailbox = mailbox(&store).await;

    let new_doc = |message_id: &str, vendor: &str| {
        NewDocument::builder()
            .account_id(mailbox.account_id)
            .mailbox_id(mailbox.id)
            .source_message_id(message_id)
            .vendor(Some(vendor.to_string()))
            .build()
    };

    let mut created = Vec::new();
    for (idx, vendor) in ["Acme", "ACME", "Acme"].iter().enumerate() {
        let doc = store
            .insert_document(new_doc(&format!("prior-{}", idx), vendor))
            .await
            .unwrap()
            .unwrap();
        store
            .apply_enrichment(
                doc.id,
                &Enrichment {
                    vendor: None,
                    amount_minor: Some(2_000),
                    currency: Some("USD".into()),
                    category: Some("software".into()),
                    doc_type: None,
                    status: DocumentStatus::Pending,
                    source: DocumentSource::Ai,
                    confidence: 0.9,
                },
            )
            .await
            .unwrap();
        created.push(doc.id);
    }

    assert!(store
        .insert_document(new_doc("prior-0", "Acme"))
        .await
        .unwrap()
        .is_none());

    let consensus = store
        .vendor_consensus(mailbox.account_id, "acme", 0.85, 3, Uuid::new_v4())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(consensus.vendor, "Acme");
    assert_eq!(consensus.category, "software");
    assert_eq!(consensus.supporting_documents, 3);

    // Excluding one of them drops below the minimum
    assert!(store
        .vendor_consensus(mailbox.account_id, "Acme", 0.85, 3, created[0])
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_full_scan_over_postgres() {
    let store = Arc::new(store().await);
    let mailbox = mailbox(&store).await;
    let mock = Arc::new(
        MockMailbox::new()
            .with_pages(vec![ids("r", 0..3)])
            .with_messages((0..3).map(|i| receipt(&format!("r-{}", i), "Uber", "7.25")))
            .with_latest_cursor("history-42"),
    );
    let deps = ScanDeps::new(
        store.clone(),
        Arc::new(MockConnector::new(mock)),
        Arc::new(MockAi::new()),
        ScanConfig::default(),
    );

    let job_id = ScanControl::new(deps.clone())
        .start(mailbox.id)
        .await
        .unwrap();
    // Drive this job only; the shared database holds other tests' jobs
    let orchestrator = ScanOrchestrator::new(deps);
    for _ in 0..5 {
        let current = store.get_job(job_id).await.unwrap().unwrap();
        if current.status.is_terminal() {
            break;
        }
        orchestrator
            .run_job(&current, &TimeBudget::start(Duration::from_secs(30)))
            .await
            .unwrap();
    }

    let job = store.get_job(job_id).await.unwrap().unwrap();
    assert_eq!(job.status, ScanStatus::Completed);
    assert_eq!(job.processed_count, 3);
    assert_eq!(job.documents_created, 3);
    assert_eq!(
        store
            .get_mailbox(mailbox.id)
            .await
            .unwrap()
            .unwrap()
            .sync_cursor
            .as_deref(),
        Some("history-42")
    );
    assert!(store
        .find_document_by_message(mailbox.account_id, "r-1")
        .await
        .unwrap()
        .is_some());
}
