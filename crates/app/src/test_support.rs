use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use httpmock::MockServer;
use reqwest::Client;
use url::Url;

use esign_core::types::DocumentStatus;
use esign_core::types::LedgerTransactionType;
use esign_providers::{
    BoldSignClient, EmailError, EmailMessage, EmailTransport, ObjectStoreClient,
    StaticTokenProvider,
};
use esign_storage::{Database, NewAgent, NewDocumentRecord, NewLedgerEntry, NewSignatureDocument};
use esign_util::WebhookVerification;

use crate::lifecycle::LifecycleExecutor;
use crate::notify::{LinkBuilder, Notifier, RetryPolicy};
use crate::router::AppState;
use crate::telemetry;

pub const FIXED_NOW: &str = "2024-01-01T00:00:00Z";
pub const TEST_SECRET: &str = "whsec_test";

pub fn fixed_now() -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(FIXED_NOW)
        .expect("fixed time")
        .with_timezone(&Utc)
}

pub fn fixed_clock() -> Arc<dyn Fn() -> DateTime<Utc> + Send + Sync> {
    Arc::new(fixed_now)
}

/// Agent `agent-1` with a purchased balance of 6 credits.
pub async fn seed_database() -> Database {
    let database = Database::connect("sqlite::memory:?cache=shared")
        .await
        .expect("connect");
    database.run_migrations().await.expect("migrations");

    database
        .agents()
        .insert(&NewAgent {
            id: "agent-1",
            email: "agent@example.com",
            display_name: "Avery Agent",
            created_at: fixed_now(),
        })
        .await
        .expect("insert agent");
    database
        .credit_ledger()
        .append(&NewLedgerEntry {
            agent_id: "agent-1",
            transaction_type: LedgerTransactionType::Purchase,
            amount: 6,
            signature_document_id: None,
            description: "Starter pack",
            created_at: fixed_now() - chrono::Duration::days(1),
        })
        .await
        .expect("purchase");
    database
}

/// Signature document linked to transaction `tx-1` and library record `rec-1`.
pub async fn seed_signature_document(
    database: &Database,
    id: &str,
    provider_document_id: &str,
    status: DocumentStatus,
) {
    let records = database.documents();
    if records.find("rec-1").await.expect("find record").is_none() {
        records
            .insert(&NewDocumentRecord {
                id: "rec-1",
                agent_id: "agent-1",
                transaction_id: Some("tx-1"),
                name: "Purchase Agreement.pdf",
                category: Some("contract"),
                storage_path: Some("documents/tx-1/rec-1/original.pdf"),
                file_size: Some(2048),
                mime_type: Some("application/pdf"),
                created_at: fixed_now(),
            })
            .await
            .expect("insert record");
    }

    database
        .signature_documents()
        .insert(&NewSignatureDocument {
            id,
            agent_id: "agent-1",
            transaction_id: Some("tx-1"),
            document_id: Some("rec-1"),
            provider_document_id,
            title: "Purchase Agreement",
            status,
            expires_at: None,
            created_at: fixed_now(),
        })
        .await
        .expect("insert signature document");
}

/// Email transport that replays scripted results and records what it was
/// asked to send. An exhausted script succeeds.
#[derive(Default)]
pub struct ScriptedTransport {
    script: Mutex<VecDeque<Result<String, EmailError>>>,
    sent: Mutex<Vec<EmailMessage>>,
}

impl ScriptedTransport {
    pub fn new(script: Vec<Result<String, EmailError>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            sent: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> usize {
        self.sent.lock().expect("sent lock").len()
    }

    pub fn sent(&self) -> Vec<EmailMessage> {
        self.sent.lock().expect("sent lock").clone()
    }
}

#[async_trait]
impl EmailTransport for ScriptedTransport {
    async fn send(&self, message: &EmailMessage) -> Result<String, EmailError> {
        let mut sent = self.sent.lock().expect("sent lock");
        sent.push(message.clone());
        let attempt = sent.len();
        drop(sent);

        self.script
            .lock()
            .expect("script lock")
            .pop_front()
            .unwrap_or_else(|| Ok(format!("msg-{attempt}")))
    }
}

pub struct Harness {
    pub state: AppState,
    pub database: Database,
    pub transport: Arc<ScriptedTransport>,
    /// Serves both the BoldSign API and object storage.
    pub provider: MockServer,
}

impl Harness {
    pub async fn seed_document(
        &self,
        id: &str,
        provider_document_id: &str,
        status: DocumentStatus,
    ) {
        seed_signature_document(&self.database, id, provider_document_id, status).await;
    }
}

/// Application state wired to an in-memory database, an httpmock provider
/// and an always-succeeding email transport. `None` runs in insecure
/// bootstrap mode.
pub async fn harness(secret: Option<&str>) -> Harness {
    harness_with_transport(secret, ScriptedTransport::default()).await
}

/// Like [`harness`] with a caller-scripted transport. Retry waits are
/// shortened to milliseconds.
pub async fn harness_with_transport(secret: Option<&str>, transport: ScriptedTransport) -> Harness {
    let metrics = telemetry::init_metrics().expect("metrics init");
    let database = seed_database().await;
    let provider = MockServer::start_async().await;
    let base = Url::parse(&provider.url("/")).expect("url");
    let http = Client::builder().build().expect("client");

    let boldsign = BoldSignClient::new(
        base.clone(),
        Arc::new(StaticTokenProvider::new("test-token")),
        http.clone(),
    );
    let object_store = ObjectStoreClient::new(base, "service-key", "documents", http);
    let transport = Arc::new(transport);
    let notifier = Notifier::new(
        transport.clone(),
        "Esign <noreply@example.com>",
        LinkBuilder::new(Url::parse("https://app.example.com/").expect("url")),
        RetryPolicy::new(Duration::from_millis(1), Duration::from_millis(5)),
    );
    let lifecycle = LifecycleExecutor::new(
        database.clone(),
        boldsign,
        object_store,
        notifier,
        fixed_clock(),
    );

    let webhook_auth = match secret {
        Some(secret) => WebhookVerification::Secret(secret.to_string()),
        None => WebhookVerification::InsecureBootstrap,
    };
    let state = AppState::new(metrics, database.clone(), webhook_auth, lifecycle)
        .with_clock(fixed_clock());

    Harness {
        state,
        database,
        transport,
        provider,
    }
}
