//! In-memory collaborators for unit tests.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::clock::{days, extended_date};
use crate::panel::{
    Client, Inbound, InboundSettings, LinkBuilder, LocatedClient, Panel, PanelApi, PanelError,
    PanelLinks, PanelRole,
};
use crate::payment::{
    Confirmation, NewPayment, Payment, PaymentError, PaymentGateway, PaymentStatus,
};
use crate::store::{PaymentRecord, Referral, SubscriptionStore};

#[derive(Default)]
struct PanelState {
    inbounds: Vec<(i64, Vec<Client>)>,
    fail_listing: bool,
    fail_writes: bool,
    list_delay: Option<Duration>,
    logins: usize,
}

#[derive(Default)]
pub struct FakePanel {
    state: Mutex<PanelState>,
}

impl FakePanel {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// A panel whose inbound 1 already holds `n` unrelated clients.
    pub fn with_clients(n: usize) -> Arc<Self> {
        let fake = Self::new();
        fake.add_inbound(1, n);
        fake
    }

    pub fn add_inbound(&self, id: i64, n: usize) {
        let clients = (0..n)
            .map(|i| Client::provision(0, &format!("seed-{}-{}", id, i), "seed", 0))
            .collect();
        self.state.lock().unwrap().inbounds.push((id, clients));
    }

    pub fn fail_listing(&self, fail: bool) {
        self.state.lock().unwrap().fail_listing = fail;
    }

    pub fn fail_writes(&self, fail: bool) {
        self.state.lock().unwrap().fail_writes = fail;
    }

    /// Make every listing yield for `ms` first, so concurrent callers interleave.
    pub fn slow_listing(&self, ms: u64) {
        self.state.lock().unwrap().list_delay = Some(Duration::from_millis(ms));
    }

    pub fn insert(&self, inbound_id: i64, client: Client) {
        let mut state = self.state.lock().unwrap();
        match state.inbounds.iter_mut().find(|(id, _)| *id == inbound_id) {
            Some((_, clients)) => clients.push(client),
            None => state.inbounds.push((inbound_id, vec![client])),
        }
    }

    pub fn clients(&self) -> Vec<Client> {
        self.state
            .lock()
            .unwrap()
            .inbounds
            .iter()
            .flat_map(|(_, clients)| clients.iter().cloned())
            .filter(|c| !c.email.starts_with("seed-"))
            .collect()
    }

    pub fn find(&self, email: &str) -> Option<Client> {
        self.clients().into_iter().find(|c| c.email == email)
    }

    pub fn count(&self, email: &str) -> usize {
        self.clients().iter().filter(|c| c.email == email).count()
    }

    pub fn logins(&self) -> usize {
        self.state.lock().unwrap().logins
    }
}

fn rejected(what: &str) -> PanelError {
    PanelError::Rejected(format!("{} failed", what))
}

#[async_trait]
impl PanelApi for FakePanel {
    async fn login(&self) -> Result<(), PanelError> {
        let mut state = self.state.lock().unwrap();
        state.logins += 1;
        if state.fail_writes {
            return Err(PanelError::Auth("wrong password".into()));
        }
        Ok(())
    }

    async fn list_inbounds(&self) -> Result<Vec<Inbound>, PanelError> {
        let delay = self.state.lock().unwrap().list_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let state = self.state.lock().unwrap();
        if state.fail_listing {
            return Err(rejected("list"));
        }
        Ok(state
            .inbounds
            .iter()
            .map(|(id, clients)| Inbound {
                id: *id,
                settings: InboundSettings {
                    clients: clients.clone(),
                },
            })
            .collect())
    }

    async fn add_client(&self, inbound_id: i64, client: &Client) -> Result<(), PanelError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_writes {
            return Err(rejected("add"));
        }
        let duplicate = state
            .inbounds
            .iter()
            .flat_map(|(_, clients)| clients.iter())
            .any(|c| c.email == client.email);
        if duplicate {
            return Err(PanelError::Rejected(format!("Duplicate email: {}", client.email)));
        }
        match state.inbounds.iter_mut().find(|(id, _)| *id == inbound_id) {
            Some((_, clients)) => clients.push(client.clone()),
            None => state.inbounds.push((inbound_id, vec![client.clone()])),
        }
        Ok(())
    }

    async fn update_client(
        &self,
        inbound_id: i64,
        client_id: &str,
        client: &Client,
    ) -> Result<(), PanelError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_writes {
            return Err(rejected("update"));
        }
        let slot = state
            .inbounds
            .iter_mut()
            .filter(|(id, _)| *id == inbound_id)
            .flat_map(|(_, clients)| clients.iter_mut())
            .find(|c| c.id == client_id)
            .ok_or_else(|| rejected("update"))?;
        *slot = client.clone();
        Ok(())
    }

    async fn get_client_by_email(&self, email: &str) -> Result<Option<LocatedClient>, PanelError> {
        let state = self.state.lock().unwrap();
        if state.fail_listing {
            return Err(rejected("traffic"));
        }
        Ok(state.inbounds.iter().find_map(|(id, clients)| {
            clients
                .iter()
                .find(|c| c.email == email)
                .map(|c| LocatedClient {
                    inbound_id: *id,
                    client: c.clone(),
                })
        }))
    }

    async fn delete_client(&self, inbound_id: i64, client_id: &str) -> Result<(), PanelError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_writes {
            return Err(rejected("delete"));
        }
        for (id, clients) in state.inbounds.iter_mut() {
            if *id == inbound_id {
                clients.retain(|c| c.id != client_id);
            }
        }
        Ok(())
    }
}

pub fn primary_panel(name: &str, fake: Arc<FakePanel>) -> Panel {
    Panel {
        name: name.to_string(),
        inbound_id: 1,
        api: fake,
        role: PanelRole::Primary(PanelLinks {
            key: LinkBuilder::Reality {
                host: format!("{}.example.net", name.to_lowercase()),
                port: 443,
                public_key: "PBK".into(),
                short_id: "sid".into(),
                sni: "google.com".into(),
                fingerprint: "chrome".into(),
                spider_x: "/".into(),
                label: name.to_string(),
            },
            subscription: LinkBuilder::Subscription {
                base_url: format!("https://{}.example.net/sub", name.to_lowercase()),
                suffix: None,
            },
        }),
    }
}

pub fn mirror_panel(name: &str, fake: Arc<FakePanel>) -> Panel {
    Panel {
        name: name.to_string(),
        inbound_id: 1,
        api: fake,
        role: PanelRole::Mirror,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoredSubscription {
    pub tg_id: i64,
    pub panel: String,
    pub expiry: DateTime<Utc>,
    pub warn: i32,
}

#[derive(Default)]
struct StoreState {
    subscriptions: HashMap<String, StoredSubscription>,
    payments: Vec<PaymentRecord>,
    trials: HashMap<i64, i32>,
    referrals: Vec<(i64, i64, bool, Option<String>)>,
    products: HashMap<(String, String), (i64, DateTime<Utc>)>,
    fail_payments: bool,
}

#[derive(Default)]
pub struct FakeStore {
    state: Mutex<StoreState>,
}

fn unavailable() -> sqlx::Error {
    sqlx::Error::PoolTimedOut
}

impl FakeStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add_referral(&self, referrer_id: i64, referee_id: i64) {
        self.state
            .lock()
            .unwrap()
            .referrals
            .push((referrer_id, referee_id, false, None));
    }

    pub fn fail_payments(&self, fail: bool) {
        self.state.lock().unwrap().fail_payments = fail;
    }

    /// A `trials` row left behind without the used flag.
    pub fn add_unused_trial(&self, tg_id: i64) {
        self.state.lock().unwrap().trials.insert(tg_id, 0);
    }

    pub fn subscription(&self, email: &str) -> Option<StoredSubscription> {
        self.state.lock().unwrap().subscriptions.get(email).cloned()
    }

    pub fn set_warn(&self, email: &str, warn: i32) {
        if let Some(sub) = self.state.lock().unwrap().subscriptions.get_mut(email) {
            sub.warn = warn;
        }
    }

    pub fn payments(&self) -> Vec<PaymentRecord> {
        self.state.lock().unwrap().payments.clone()
    }

    pub fn product(&self, login: &str, product: &str) -> Option<DateTime<Utc>> {
        self.state
            .lock()
            .unwrap()
            .products
            .get(&(login.to_string(), product.to_string()))
            .map(|(_, expiry)| *expiry)
    }
}

#[async_trait]
impl SubscriptionStore for FakeStore {
    async fn add_subscription(
        &self,
        tg_id: i64,
        email: &str,
        panel: &str,
        expiry: DateTime<Utc>,
    ) -> Result<(), sqlx::Error> {
        let mut state = self.state.lock().unwrap();
        if state.subscriptions.contains_key(email) {
            return Err(sqlx::Error::RowNotFound);
        }
        state.subscriptions.insert(
            email.to_string(),
            StoredSubscription {
                tg_id,
                panel: panel.to_string(),
                expiry,
                warn: 0,
            },
        );
        Ok(())
    }

    async fn upsert_subscription(
        &self,
        tg_id: i64,
        email: &str,
        panel: &str,
        expiry: DateTime<Utc>,
    ) -> Result<(), sqlx::Error> {
        let mut state = self.state.lock().unwrap();
        let entry = state
            .subscriptions
            .entry(email.to_string())
            .or_insert_with(|| StoredSubscription {
                tg_id,
                panel: panel.to_string(),
                expiry,
                warn: 0,
            });
        entry.expiry = expiry;
        entry.warn = 0;
        Ok(())
    }

    async fn add_payment(&self, record: &PaymentRecord) -> Result<(), sqlx::Error> {
        let mut state = self.state.lock().unwrap();
        if state.fail_payments {
            return Err(unavailable());
        }
        state.payments.push(record.clone());
        Ok(())
    }

    async fn payment_recorded(&self, label: &str) -> Result<bool, sqlx::Error> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .payments
            .iter()
            .any(|p| p.label == label))
    }

    async fn trial_used(&self, tg_id: i64) -> Result<bool, sqlx::Error> {
        Ok(self.state.lock().unwrap().trials.get(&tg_id) == Some(&1))
    }

    async fn mark_trial_used(&self, tg_id: i64) -> Result<(), sqlx::Error> {
        self.state.lock().unwrap().trials.insert(tg_id, 1);
        Ok(())
    }

    async fn referrals(&self, referrer_id: i64) -> Result<Vec<Referral>, sqlx::Error> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .referrals
            .iter()
            .filter(|(referrer, ..)| *referrer == referrer_id)
            .map(|(_, referee, applied, date)| Referral {
                referee_id: referee.to_string(),
                bonus_applied: *applied,
                bonus_date: date.clone(),
            })
            .collect())
    }

    async fn mark_bonus_applied(
        &self,
        referrer_id: i64,
        referee_id: i64,
        at: DateTime<Utc>,
    ) -> Result<bool, sqlx::Error> {
        let mut state = self.state.lock().unwrap();
        let pair = state.referrals.iter_mut().find(|(referrer, referee, applied, _)| {
            *referrer == referrer_id && *referee == referee_id && !*applied
        });
        Ok(match pair {
            Some(row) => {
                row.2 = true;
                row.3 = Some(crate::clock::format_db_time(at));
                true
            }
            None => false,
        })
    }

    async fn upsert_product(
        &self,
        tg_id: i64,
        product: &str,
        login: &str,
        n: i64,
        now: DateTime<Utc>,
    ) -> Result<DateTime<Utc>, sqlx::Error> {
        let mut state = self.state.lock().unwrap();
        let key = (login.to_string(), product.to_string());
        let expiry = match state.products.get(&key) {
            Some((_, current)) => extended_date(*current, now, n),
            None => now + days(n),
        };
        state.products.insert(key, (tg_id, expiry));
        Ok(expiry)
    }
}

#[derive(Default)]
struct GatewayState {
    payments: HashMap<String, Payment>,
    next_id: usize,
    cancelled: Vec<String>,
}

#[derive(Default)]
pub struct FakeGateway {
    state: Mutex<GatewayState>,
}

impl FakeGateway {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_status(&self, id: &str, status: PaymentStatus) {
        if let Some(p) = self.state.lock().unwrap().payments.get_mut(id) {
            p.status = status;
        }
    }

    pub fn payment(&self, id: &str) -> Option<Payment> {
        self.state.lock().unwrap().payments.get(id).cloned()
    }

    pub fn cancelled(&self) -> Vec<String> {
        self.state.lock().unwrap().cancelled.clone()
    }
}

#[async_trait]
impl PaymentGateway for FakeGateway {
    async fn create_payment(&self, payment: NewPayment) -> Result<Payment, PaymentError> {
        let mut state = self.state.lock().unwrap();
        state.next_id += 1;
        let id = format!("pay-{}", state.next_id);
        let created = Payment {
            id: id.clone(),
            status: PaymentStatus::Pending,
            amount: payment.amount,
            confirmation: Some(Confirmation {
                confirmation_url: Some(format!("https://pay.example/{}", id)),
            }),
            metadata: payment.metadata,
        };
        state.payments.insert(id, created.clone());
        Ok(created)
    }

    async fn find_payment(&self, id: &str) -> Result<Payment, PaymentError> {
        self.payment(id).ok_or_else(|| PaymentError::Rejected {
            status: 404,
            body: format!("payment {} not found", id),
        })
    }

    async fn cancel_payment(&self, id: &str) -> Result<Payment, PaymentError> {
        let mut state = self.state.lock().unwrap();
        state.cancelled.push(id.to_string());
        let payment = state
            .payments
            .get_mut(id)
            .ok_or_else(|| PaymentError::Rejected {
                status: 404,
                body: format!("payment {} not found", id),
            })?;
        payment.status = PaymentStatus::Canceled;
        Ok(payment.clone())
    }
}

#[derive(Default)]
pub struct FakeNotifier {
    messages: Mutex<Vec<String>>,
}

impl FakeNotifier {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn messages(&self) -> Vec<String> {
        self.messages.lock().unwrap().clone()
    }
}

#[async_trait]
impl crate::notify::NotificationSink for FakeNotifier {
    async fn notify(&self, text: &str) {
        self.messages.lock().unwrap().push(text.to_string());
    }
}
