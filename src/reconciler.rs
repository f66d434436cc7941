//! Creates and extends clients on the chosen primary panel and replays the
//! same action on every mirror panel.
//!
//! The primary panel is authoritative: a failure there is terminal for the
//! request. Mirror failures are recorded in the [`StepLog`] and never abort
//! the remaining mirrors or the overall operation.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::{error, warn};

use crate::clock::{extended_expiry, from_millis};
use crate::error::{ApiError, ApiResult};
use crate::labels::{generate_sub_id, is_trial, SubscriptionClass};
use crate::panel::selector::select_least_loaded;
use crate::panel::{Client, LocatedClient, Panel, PanelRegistry};
use crate::steps::{Outcome, Step, StepLog};

/// A client of `tg_id` found on a primary panel.
#[derive(Debug, Clone, PartialEq)]
pub struct ActiveSubscription {
    pub email: String,
    pub panel: String,
    pub key: String,
    pub sub_link: String,
    pub expiry: DateTime<Utc>,
    pub is_expired: bool,
}

#[derive(Debug, Clone)]
pub struct Provisioned {
    pub panel: String,
    pub client: Client,
    pub key: String,
    pub sub_link: String,
}

impl Provisioned {
    pub fn expiry(&self) -> DateTime<Utc> {
        from_millis(self.client.expiry_time)
    }
}

#[derive(Debug, Clone)]
pub struct Extended {
    pub panel: String,
    pub expiry: DateTime<Utc>,
}

pub struct SubscriptionReconciler {
    registry: Arc<PanelRegistry>,
}

impl SubscriptionReconciler {
    pub fn new(registry: Arc<PanelRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &PanelRegistry {
        &self.registry
    }

    /// Every client owned by `tg_id` across the primary panels. A panel that
    /// cannot be listed is logged and skipped.
    pub async fn subscriptions_for(&self, tg_id: i64) -> Vec<ActiveSubscription> {
        let now = Utc::now();
        let mut subscriptions = Vec::new();
        for panel in self.registry.primaries() {
            let Some(links) = panel.links() else { continue };
            let inbounds = match panel.api.list_inbounds().await {
                Ok(inbounds) => inbounds,
                Err(e) => {
                    error!("Cannot list subscriptions on {}: {}", panel.name, e);
                    continue;
                }
            };
            for client in inbounds
                .iter()
                .flat_map(|i| i.settings.clients.iter())
                .filter(|c| c.tg_id == tg_id)
            {
                let expiry = from_millis(client.expiry_time);
                subscriptions.push(ActiveSubscription {
                    email: client.email.clone(),
                    panel: panel.name.clone(),
                    key: links.key.build(client),
                    sub_link: links.subscription.build(client),
                    expiry,
                    is_expired: expiry <= now,
                });
            }
        }
        subscriptions
    }

    /// Create a client on the least-loaded primary panel, then on every mirror.
    pub async fn provision(
        &self,
        tg_id: i64,
        email: &str,
        expiry: DateTime<Utc>,
        log: &mut StepLog,
    ) -> ApiResult<Provisioned> {
        let panel = select_least_loaded(self.registry.primaries())
            .await
            .ok_or(ApiError::NoPanelAvailable)?;
        self.create_on(panel, tg_id, email, expiry, log).await
    }

    pub async fn create_on(
        &self,
        panel: &Panel,
        tg_id: i64,
        email: &str,
        expiry: DateTime<Utc>,
        log: &mut StepLog,
    ) -> ApiResult<Provisioned> {
        let links = panel
            .links()
            .ok_or_else(|| ApiError::validation(format!("{} is not a primary panel", panel.name)))?;

        let client = Client::provision(tg_id, email, &generate_sub_id(), expiry.timestamp_millis());
        log.track(
            Step::PrimaryCreate(panel.name.clone()),
            panel.api.add_client(panel.inbound_id, &client).await,
        )?;

        self.mirror_create(&client, log).await;

        Ok(Provisioned {
            panel: panel.name.clone(),
            key: links.key.build(&client),
            sub_link: links.subscription.build(&client),
            client,
        })
    }

    /// Replicate `primary` on each mirror that does not hold its email yet.
    /// Each mirror gets its own client id; email, owner, link id and expiry
    /// are copied.
    pub async fn mirror_create(&self, primary: &Client, log: &mut StepLog) {
        for mirror in self.registry.mirrors() {
            let step = Step::MirrorCreate(mirror.name.clone());
            match mirror.api.get_client_by_email(&primary.email).await {
                Ok(Some(_)) => log.record(step, Outcome::Skipped("already present".into())),
                Ok(None) => {
                    let copy = Client::provision(
                        primary.tg_id,
                        &primary.email,
                        &primary.sub_id,
                        primary.expiry_time,
                    );
                    let result = mirror.api.add_client(mirror.inbound_id, &copy).await;
                    let _ = log.track(step, result);
                }
                Err(e) => log.record(step, Outcome::Failed(e.to_string())),
            }
        }
    }

    async fn find_owned_client(
        panel: &Panel,
        email: &str,
        tg_id: i64,
    ) -> ApiResult<Option<LocatedClient>> {
        let inbounds = panel.api.list_inbounds().await?;
        Ok(inbounds.into_iter().find_map(|inbound| {
            let inbound_id = inbound.id;
            inbound
                .settings
                .clients
                .into_iter()
                .find(|c| c.email == email && c.tg_id == tg_id)
                .map(|client| LocatedClient { inbound_id, client })
        }))
    }

    /// Push the expiry of `email` on `panel_name` back by `days`, then do the
    /// same on every mirror, each from its own stored expiry.
    pub async fn extend(
        &self,
        panel_name: &str,
        email: &str,
        tg_id: i64,
        days: i64,
        log: &mut StepLog,
    ) -> ApiResult<Extended> {
        if is_trial(email) {
            return Err(ApiError::validation("Trial subscriptions cannot be extended"));
        }
        let panel = self
            .registry
            .primary(panel_name)
            .ok_or_else(|| ApiError::not_found(format!("Panel {} not found", panel_name)))?;

        let located = Self::find_owned_client(panel, email, tg_id)
            .await?
            .ok_or_else(|| ApiError::not_found("Client not found"))?;
        let current = &located.client;

        let new_expiry = extended_expiry(current.expiry_time, Utc::now().timestamp_millis(), days);
        let updated = current.renewed(tg_id, &current.sub_id, new_expiry);
        log.track(
            Step::PrimaryExtend(panel.name.clone()),
            panel
                .api
                .update_client(located.inbound_id, &current.id, &updated)
                .await,
        )?;

        self.mirror_extend(email, tg_id, &current.sub_id, days, log).await;

        Ok(Extended {
            panel: panel.name.clone(),
            expiry: from_millis(new_expiry),
        })
    }

    async fn mirror_extend(
        &self,
        email: &str,
        tg_id: i64,
        sub_id: &str,
        days: i64,
        log: &mut StepLog,
    ) {
        for mirror in self.registry.mirrors() {
            let step = Step::MirrorExtend(mirror.name.clone());
            let located = match mirror.api.get_client_by_email(email).await {
                Ok(Some(located)) => located,
                Ok(None) => {
                    warn!("{} missing on mirror {}, not extended", email, mirror.name);
                    log.record(step, Outcome::Skipped("not present".into()));
                    continue;
                }
                Err(e) => {
                    log.record(step, Outcome::Failed(e.to_string()));
                    continue;
                }
            };

            let new_expiry = extended_expiry(
                located.client.expiry_time,
                Utc::now().timestamp_millis(),
                days,
            );
            let updated = located.client.renewed(tg_id, sub_id, new_expiry);
            let result = mirror
                .api
                .update_client(located.inbound_id, &located.client.id, &updated)
                .await;
            let _ = log.track(step, result);
        }
    }

    /// Administrative removal of a service-issued client from a primary panel
    /// and every mirror. Returns how many clients were deleted.
    pub async fn remove(&self, panel_name: &str, email: &str, log: &mut StepLog) -> ApiResult<usize> {
        if SubscriptionClass::of(email).is_none() {
            return Err(ApiError::validation(format!(
                "{} is not a service-issued subscription",
                email
            )));
        }
        let panel = self
            .registry
            .primary(panel_name)
            .ok_or_else(|| ApiError::not_found(format!("Panel {} not found", panel_name)))?;

        let mut removed = 0;
        for inbound in panel.api.list_inbounds().await? {
            for client in inbound.settings.clients.iter().filter(|c| c.email == email) {
                log.track(
                    Step::RemoveClient(panel.name.clone()),
                    panel.api.delete_client(inbound.id, &client.id).await,
                )?;
                removed += 1;
            }
        }
        if removed == 0 {
            return Err(ApiError::not_found("Client not found"));
        }

        for mirror in self.registry.mirrors() {
            let step = Step::RemoveClient(mirror.name.clone());
            match mirror.api.get_client_by_email(email).await {
                Ok(Some(located)) => {
                    let result = mirror
                        .api
                        .delete_client(located.inbound_id, &located.client.id)
                        .await;
                    if log.track(step, result).is_ok() {
                        removed += 1;
                    }
                }
                Ok(None) => log.record(step, Outcome::Skipped("not present".into())),
                Err(e) => log.record(step, Outcome::Failed(e.to_string())),
            }
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{days, now_seconds};
    use crate::testing::{mirror_panel, primary_panel, FakePanel};

    const DAY_MS: i64 = 24 * 60 * 60 * 1000;

    struct Fixture {
        primaries: Vec<Arc<FakePanel>>,
        mirrors: Vec<Arc<FakePanel>>,
        reconciler: SubscriptionReconciler,
    }

    fn fixture(primary_loads: &[usize], mirror_count: usize) -> Fixture {
        let primaries: Vec<_> = primary_loads
            .iter()
            .map(|&n| FakePanel::with_clients(n))
            .collect();
        let mirrors: Vec<_> = (0..mirror_count).map(|_| FakePanel::new()).collect();
        let registry = PanelRegistry::new(
            primaries
                .iter()
                .enumerate()
                .map(|(i, f)| primary_panel(&format!("Panel{}", i + 1), f.clone()))
                .collect(),
            mirrors
                .iter()
                .enumerate()
                .map(|(i, f)| mirror_panel(&format!("Mirror{}", i + 1), f.clone()))
                .collect(),
        );
        Fixture {
            primaries,
            mirrors,
            reconciler: SubscriptionReconciler::new(Arc::new(registry)),
        }
    }

    #[tokio::test]
    async fn provision_uses_least_loaded_panel_and_every_mirror() {
        let fx = fixture(&[4, 1], 2);
        let expiry = now_seconds() + days(30);
        let mut log = StepLog::new("t");

        let created = fx
            .reconciler
            .provision(42, "DE-FRA-USER-42-aaaaaa", expiry, &mut log)
            .await
            .unwrap();

        assert_eq!(created.panel, "Panel2");
        assert_eq!(created.expiry(), expiry);
        let on_primary = fx.primaries[1].find("DE-FRA-USER-42-aaaaaa").unwrap();
        assert!(on_primary.enable);
        assert_eq!(on_primary.limit_ip, 5);
        assert_eq!(on_primary.tg_id, 42);
        assert!(created.sub_link.ends_with(&on_primary.sub_id));
        assert!(created.key.contains(&on_primary.id));

        for mirror in &fx.mirrors {
            let copy = mirror.find("DE-FRA-USER-42-aaaaaa").unwrap();
            assert_eq!(copy.expiry_time, on_primary.expiry_time);
            assert_eq!(copy.sub_id, on_primary.sub_id);
            assert_ne!(copy.id, on_primary.id);
        }
        assert!(log.failed().is_empty());
    }

    #[tokio::test]
    async fn no_panel_when_every_probe_fails() {
        let fx = fixture(&[0, 0], 1);
        for p in &fx.primaries {
            p.fail_listing(true);
        }
        let mut log = StepLog::new("t");
        let err = fx
            .reconciler
            .provision(1, "DE-FRA-USER-1-aaaaaa", now_seconds(), &mut log)
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::NoPanelAvailable));
        assert!(fx.mirrors[0].clients().is_empty());
    }

    #[tokio::test]
    async fn primary_failure_is_terminal_and_skips_mirrors() {
        let fx = fixture(&[0], 1);
        fx.primaries[0].fail_writes(true);
        let mut log = StepLog::new("t");
        let err = fx
            .reconciler
            .provision(1, "DE-FRA-USER-1-aaaaaa", now_seconds(), &mut log)
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Panel(_)));
        assert!(fx.mirrors[0].clients().is_empty());
    }

    #[tokio::test]
    async fn mirror_failure_does_not_abort() {
        let fx = fixture(&[0], 3);
        fx.mirrors[0].fail_writes(true);
        fx.mirrors[1].fail_listing(true);
        let mut log = StepLog::new("t");

        fx.reconciler
            .provision(9, "DE-FRA-USER-9-aaaaaa", now_seconds() + days(7), &mut log)
            .await
            .unwrap();

        assert!(fx.primaries[0].find("DE-FRA-USER-9-aaaaaa").is_some());
        assert!(fx.mirrors[2].find("DE-FRA-USER-9-aaaaaa").is_some());
        assert_eq!(
            log.failed(),
            vec![
                &Step::MirrorCreate("Mirror1".into()),
                &Step::MirrorCreate("Mirror2".into())
            ]
        );
    }

    #[tokio::test]
    async fn mirroring_twice_is_a_no_op() {
        let fx = fixture(&[0], 2);
        let client = Client::provision(5, "DE-FRA-USER-5-bbbbbb", "subid", 123);
        let mut log = StepLog::new("t");

        fx.reconciler.mirror_create(&client, &mut log).await;
        fx.reconciler.mirror_create(&client, &mut log).await;

        for mirror in &fx.mirrors {
            assert_eq!(mirror.count("DE-FRA-USER-5-bbbbbb"), 1);
        }
        assert!(log.failed().is_empty());
        let skipped = log
            .entries()
            .iter()
            .filter(|(_, o)| matches!(o, Outcome::Skipped(_)))
            .count();
        assert_eq!(skipped, 2);
    }

    #[tokio::test]
    async fn extend_active_subscription_stacks() {
        let fx = fixture(&[0], 1);
        let now = Utc::now().timestamp_millis();
        let expiry = now + 10 * DAY_MS;
        let original = Client::provision(7, "DE-FRA-USER-7-cccccc", "sub7", expiry);
        fx.primaries[0].insert(1, original.clone());
        fx.mirrors[0].insert(1, Client::provision(7, "DE-FRA-USER-7-cccccc", "sub7", expiry));

        let mut log = StepLog::new("t");
        let extended = fx
            .reconciler
            .extend("Panel1", "DE-FRA-USER-7-cccccc", 7, 30, &mut log)
            .await
            .unwrap();

        assert_eq!(extended.expiry.timestamp_millis(), expiry + 30 * DAY_MS);
        let stored = fx.primaries[0].find("DE-FRA-USER-7-cccccc").unwrap();
        assert_eq!(stored.id, original.id);
        assert_eq!(stored.sub_id, "sub7");
        assert_eq!(stored.expiry_time, expiry + 30 * DAY_MS);
        assert_eq!(
            fx.mirrors[0].find("DE-FRA-USER-7-cccccc").unwrap().expiry_time,
            expiry + 30 * DAY_MS
        );
    }

    #[tokio::test]
    async fn extend_lapsed_subscription_restarts_from_now() {
        let fx = fixture(&[0], 0);
        let lapsed = Utc::now().timestamp_millis() - 3 * DAY_MS;
        let mut stale = Client::provision(7, "DE-FRA-USER-7-dddddd", "sub7", lapsed);
        stale.enable = false;
        stale.limit_ip = 1;
        fx.primaries[0].insert(1, stale);

        let before = Utc::now().timestamp_millis();
        let mut log = StepLog::new("t");
        fx.reconciler
            .extend("Panel1", "DE-FRA-USER-7-dddddd", 7, 7, &mut log)
            .await
            .unwrap();
        let after = Utc::now().timestamp_millis();

        let stored = fx.primaries[0].find("DE-FRA-USER-7-dddddd").unwrap();
        assert!(stored.expiry_time >= before + 7 * DAY_MS);
        assert!(stored.expiry_time <= after + 7 * DAY_MS);
        assert!(stored.enable);
        assert_eq!(stored.limit_ip, 5);
    }

    #[tokio::test]
    async fn each_mirror_extends_from_its_own_expiry() {
        let fx = fixture(&[0], 2);
        let now = Utc::now().timestamp_millis();
        let email = "DE-FRA-USER-3-eeeeee";
        fx.primaries[0].insert(1, Client::provision(3, email, "s", now + 5 * DAY_MS));
        fx.mirrors[0].insert(1, Client::provision(3, email, "s", now + 2 * DAY_MS));
        fx.mirrors[1].insert(1, Client::provision(3, email, "s", now - DAY_MS));

        let mut log = StepLog::new("t");
        fx.reconciler
            .extend("Panel1", email, 3, 10, &mut log)
            .await
            .unwrap();

        assert_eq!(
            fx.mirrors[0].find(email).unwrap().expiry_time,
            now + 12 * DAY_MS
        );
        let restarted = fx.mirrors[1].find(email).unwrap().expiry_time;
        assert!(restarted >= now + 10 * DAY_MS);
        assert!(restarted < now + 11 * DAY_MS);
    }

    #[tokio::test]
    async fn extend_missing_client_never_creates() {
        let fx = fixture(&[0], 1);
        let mut log = StepLog::new("t");
        let err = fx
            .reconciler
            .extend("Panel1", "DE-FRA-USER-1-ffffff", 1, 30, &mut log)
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::NotFound(_)));
        assert!(fx.primaries[0].find("DE-FRA-USER-1-ffffff").is_none());
        assert!(fx.mirrors[0].clients().is_empty());
    }

    #[tokio::test]
    async fn extend_requires_matching_owner() {
        let fx = fixture(&[0], 0);
        fx.primaries[0].insert(1, Client::provision(1, "DE-FRA-USER-1-gggggg", "s", 0));
        let mut log = StepLog::new("t");
        let err = fx
            .reconciler
            .extend("Panel1", "DE-FRA-USER-1-gggggg", 2, 30, &mut log)
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::NotFound(_)));
    }

    #[tokio::test]
    async fn trials_are_never_extended() {
        let fx = fixture(&[0], 0);
        let email = "DE-FRA-TRIAL-8-hhhhhh";
        let mut log = StepLog::new("t");
        fx.reconciler
            .provision(8, email, now_seconds() + days(3), &mut log)
            .await
            .unwrap();
        let before = fx.primaries[0].find(email).unwrap();

        for n in [1, 7, 30, 360] {
            let err = fx
                .reconciler
                .extend("Panel1", email, 8, n, &mut log)
                .await
                .unwrap_err();
            assert!(matches!(err, ApiError::Validation(_)));
        }
        assert_eq!(fx.primaries[0].find(email).unwrap(), before);
    }

    #[tokio::test]
    async fn subscriptions_are_listed_per_owner() {
        let fx = fixture(&[0, 0], 0);
        let now = Utc::now().timestamp_millis();
        fx.primaries[0].insert(1, Client::provision(4, "DE-FRA-USER-4-aaaaaa", "a", now + DAY_MS));
        fx.primaries[1].insert(1, Client::provision(4, "DE-FRA-USER-4-bbbbbb", "b", now - DAY_MS));
        fx.primaries[1].insert(1, Client::provision(5, "DE-FRA-USER-5-cccccc", "c", now + DAY_MS));

        let mut subs = fx.reconciler.subscriptions_for(4).await;
        subs.sort_by(|a, b| a.email.cmp(&b.email));
        assert_eq!(subs.len(), 2);
        assert_eq!(subs[0].panel, "Panel1");
        assert!(!subs[0].is_expired);
        assert_eq!(subs[1].panel, "Panel2");
        assert!(subs[1].is_expired);
        assert!(subs[1].sub_link.ends_with("/b"));
    }

    #[tokio::test]
    async fn listing_skips_unreachable_panels() {
        let fx = fixture(&[0, 0], 0);
        fx.primaries[0].insert(1, Client::provision(4, "DE-FRA-USER-4-aaaaaa", "a", 0));
        fx.primaries[1].insert(1, Client::provision(4, "DE-FRA-USER-4-bbbbbb", "b", 0));
        fx.primaries[0].fail_listing(true);
        let subs = fx.reconciler.subscriptions_for(4).await;
        assert_eq!(subs.len(), 1);
        assert_eq!(subs[0].panel, "Panel2");
    }

    #[tokio::test]
    async fn remove_deletes_everywhere() {
        let fx = fixture(&[0], 2);
        let email = "DE-FRA-USER-6-aaaaaa";
        let mut log = StepLog::new("t");
        fx.reconciler
            .provision(6, email, now_seconds() + days(7), &mut log)
            .await
            .unwrap();

        let removed = fx.reconciler.remove("Panel1", email, &mut log).await.unwrap();
        assert_eq!(removed, 3);
        assert!(fx.primaries[0].find(email).is_none());
        assert!(fx.mirrors.iter().all(|m| m.find(email).is_none()));
    }

    #[tokio::test]
    async fn remove_rejects_foreign_labels() {
        let fx = fixture(&[0], 0);
        let mut log = StepLog::new("t");
        let err = fx
            .reconciler
            .remove("Panel1", "admin@example.com", &mut log)
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Validation(_)));
    }
}
