//! Business operations behind the HTTP routes: payments, renewals, trials,
//! referral bonuses and product orders.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::{info, warn};

use crate::clock::{days, extended_date, format_db_time, now_seconds};
use crate::error::{ApiError, ApiResult};
use crate::labels::{is_trial, SubscriptionClass};
use crate::locks::KeyedLocks;
use crate::models::{
    check_order_days, price_for, product_key, BonusAction, BonusApplied, BuyProductRequest,
    BuySubscriptionRequest, ExtendSubscriptionRequest, OrderSubmitted, PaymentCreated,
    PaymentState, ProductOrder, ProductPaymentCreated, ProductPaymentState, ReauthOutcome,
    ReferralBonusRequest, Removed, StatusResponse, SubmitOrderRequest, SubscriptionOrder,
    SubscriptionView, TrialActivated, REFERRAL_BONUS_DAYS, TRIAL_DAYS,
};
use crate::notify::NotificationSink;
use crate::payment::{Amount, NewPayment, Payment, PaymentGateway, PaymentStatus};
use crate::reconciler::{ActiveSubscription, SubscriptionReconciler};
use crate::steps::{Step, StepLog};
use crate::store::{PaymentRecord, Referral, SubscriptionStore, REFERRAL_BONUS_LABEL};

#[derive(Debug, Clone)]
pub struct ServiceSettings {
    pub bot_token: String,
    pub base_redirect_url: String,
    pub admin_api_token: Option<String>,
}

/// Which subscription a referral bonus lands on.
#[derive(Debug, PartialEq)]
pub enum BonusTarget<'a> {
    Create,
    Extend(&'a ActiveSubscription),
}

/// Pick the bonus target from the referrer's non-trial subscriptions.
pub fn bonus_target<'a>(
    subscriptions: &'a [ActiveSubscription],
    email: Option<&str>,
) -> ApiResult<BonusTarget<'a>> {
    match subscriptions {
        [] => Ok(BonusTarget::Create),
        [only] => Ok(BonusTarget::Extend(only)),
        many => {
            let email = email
                .filter(|e| !e.is_empty())
                .ok_or_else(|| ApiError::validation("Email is required when there are several subscriptions"))?;
            many.iter()
                .find(|s| s.email == email)
                .map(BonusTarget::Extend)
                .ok_or_else(|| ApiError::not_found("Subscription not found"))
        }
    }
}

pub struct SubscriptionService {
    reconciler: SubscriptionReconciler,
    store: Arc<dyn SubscriptionStore>,
    payments: Arc<dyn PaymentGateway>,
    notifier: Arc<dyn NotificationSink>,
    locks: KeyedLocks,
    settings: ServiceSettings,
}

impl SubscriptionService {
    pub fn new(
        reconciler: SubscriptionReconciler,
        store: Arc<dyn SubscriptionStore>,
        payments: Arc<dyn PaymentGateway>,
        notifier: Arc<dyn NotificationSink>,
        settings: ServiceSettings,
    ) -> Self {
        Self {
            reconciler,
            store,
            payments,
            notifier,
            locks: KeyedLocks::new(),
            settings,
        }
    }

    pub fn settings(&self) -> &ServiceSettings {
        &self.settings
    }

    fn redirect_url(&self, sub_url: &str) -> String {
        let encoded: String = form_urlencoded::byte_serialize(sub_url.as_bytes()).collect();
        format!(
            "{}/?key={}",
            self.settings.base_redirect_url.trim_end_matches('/'),
            encoded
        )
    }

    async fn owned_subscription(&self, tg_id: i64, email: &str) -> ApiResult<ActiveSubscription> {
        self.reconciler
            .subscriptions_for(tg_id)
            .await
            .into_iter()
            .find(|s| s.email == email)
            .ok_or_else(|| ApiError::not_found("Subscription not found"))
    }

    pub async fn list_subscriptions(&self, tg_id: i64) -> Vec<SubscriptionView> {
        self.reconciler
            .subscriptions_for(tg_id)
            .await
            .into_iter()
            .map(|s| SubscriptionView {
                redirect_url: self.redirect_url(&s.sub_link),
                email: s.email,
                panel: s.panel,
                expiry_date: format_db_time(s.expiry),
                is_expired: s.is_expired,
                sub_url: s.sub_link,
            })
            .collect()
    }

    pub async fn list_referrals(&self, tg_id: i64) -> ApiResult<Vec<Referral>> {
        Ok(self.store.referrals(tg_id).await?)
    }

    async fn open_payment(
        &self,
        order: &SubscriptionOrder,
        price: i64,
        expiry: DateTime<Utc>,
    ) -> ApiResult<PaymentCreated> {
        let kind = if order.is_extension { "Renewal" } else { "Purchase" };
        let payment = self
            .payments
            .create_payment(NewPayment {
                amount: Amount::rub(price),
                description: format!("{} of VPN subscription for {} days", kind, order.days),
                metadata: order.to_metadata(),
            })
            .await?;
        info!(
            "Payment {} opened: tg_id={}, email={}, days={}, extension={}",
            payment.id, order.tg_id, order.email, order.days, order.is_extension
        );
        Ok(PaymentCreated {
            email: order.email.clone(),
            payment_url: payment.confirmation_url()?.to_string(),
            payment_id: payment.id,
            expiry_date: format_db_time(expiry),
        })
    }

    pub async fn buy_subscription(&self, req: BuySubscriptionRequest) -> ApiResult<PaymentCreated> {
        let price = price_for(req.days)?;
        let order = SubscriptionOrder {
            tg_id: req.tg_id,
            days: req.days,
            email: SubscriptionClass::User.new_label(req.tg_id),
            is_extension: false,
        };
        self.open_payment(&order, price, now_seconds() + days(req.days))
            .await
    }

    pub async fn request_extension(
        &self,
        req: ExtendSubscriptionRequest,
    ) -> ApiResult<PaymentCreated> {
        let price = price_for(req.days)?;
        if is_trial(&req.email) {
            return Err(ApiError::validation("Trial subscriptions cannot be extended"));
        }
        let current = self.owned_subscription(req.tg_id, &req.email).await?;
        let order = SubscriptionOrder {
            tg_id: req.tg_id,
            days: req.days,
            email: req.email,
            is_extension: true,
        };
        let projected = extended_date(current.expiry, now_seconds(), req.days);
        self.open_payment(&order, price, projected).await
    }

    /// Apply a succeeded subscription payment exactly once per payment id.
    pub async fn confirm_subscription_payment(&self, payment_id: &str) -> ApiResult<PaymentState> {
        let payment = self.payments.find_payment(payment_id).await?;
        if payment.status != PaymentStatus::Succeeded {
            return Ok(PaymentState {
                status: payment.status.as_str().to_string(),
                days: None,
                expiry_date: None,
            });
        }
        let order = SubscriptionOrder::from_metadata(&payment.metadata)?;

        let _guard = self.locks.lock(&order.email).await;

        if self.store.payment_recorded(&payment.id).await? {
            info!("Payment {} already applied", payment.id);
            let expiry = self
                .owned_subscription(order.tg_id, &order.email)
                .await
                .ok()
                .map(|s| format_db_time(s.expiry));
            return Ok(PaymentState {
                status: payment.status.as_str().to_string(),
                days: Some(order.days),
                expiry_date: expiry,
            });
        }

        let mut log = StepLog::new(format!("payment {} / {}", payment.id, order.email));
        let result = self.apply_subscription_payment(&payment, &order, &mut log).await;
        log.finish();

        let expiry = result?;
        Ok(PaymentState {
            status: payment.status.as_str().to_string(),
            days: Some(order.days),
            expiry_date: Some(format_db_time(expiry)),
        })
    }

    async fn apply_subscription_payment(
        &self,
        payment: &Payment,
        order: &SubscriptionOrder,
        log: &mut StepLog,
    ) -> ApiResult<DateTime<Utc>> {
        let now = now_seconds();
        let (expiry, operation) = if order.is_extension {
            let current = self.owned_subscription(order.tg_id, &order.email).await?;
            let extended = self
                .reconciler
                .extend(&current.panel, &order.email, order.tg_id, order.days, log)
                .await?;
            log.track(
                Step::PersistSubscription,
                self.store
                    .upsert_subscription(order.tg_id, &order.email, &extended.panel, extended.expiry)
                    .await,
            )?;
            (extended.expiry, "renewal")
        } else if let Ok(existing) = self.owned_subscription(order.tg_id, &order.email).await {
            // An earlier poll created the client but stopped before the
            // payment row; finish that purchase instead of creating again.
            info!(
                "Purchase {} resumes on {} for {}",
                payment.id, existing.panel, order.email
            );
            log.track(
                Step::PersistSubscription,
                self.store
                    .upsert_subscription(order.tg_id, &order.email, &existing.panel, existing.expiry)
                    .await,
            )?;
            (existing.expiry, "purchase")
        } else {
            let provisioned = self
                .reconciler
                .provision(order.tg_id, &order.email, now + days(order.days), log)
                .await?;
            let expiry = provisioned.expiry();
            log.track(
                Step::PersistSubscription,
                self.store
                    .add_subscription(order.tg_id, &order.email, &provisioned.panel, expiry)
                    .await,
            )?;
            (expiry, "purchase")
        };

        let record = PaymentRecord {
            telegram_id: order.tg_id,
            label: payment.id.clone(),
            operation_type: operation.to_string(),
            payment_time: now,
            amount: payment.amount.value.clone(),
            email: order.email.clone(),
        };
        log.track(Step::RecordPayment, self.store.add_payment(&record).await)?;
        Ok(expiry)
    }

    pub async fn buy_product(&self, req: BuyProductRequest) -> ApiResult<ProductPaymentCreated> {
        if req.product.trim().is_empty() || req.login.trim().is_empty() || req.password.is_empty() {
            return Err(ApiError::validation("Product, login and password are required"));
        }
        check_order_days(req.days)?;
        if req.amount <= 0 {
            return Err(ApiError::validation("Amount must be positive"));
        }
        let order = ProductOrder {
            tg_id: req.tg_id,
            product: req.product,
            login: req.login,
            password: req.password,
            days: req.days,
        };
        let payment = self
            .payments
            .create_payment(NewPayment {
                amount: Amount::rub(req.amount),
                description: format!("{} for {} days", order.product, order.days),
                metadata: order.to_metadata(),
            })
            .await?;
        info!("Product payment {} opened: {} for tg_id={}", payment.id, order.product, order.tg_id);
        Ok(ProductPaymentCreated {
            payment_url: payment.confirmation_url()?.to_string(),
            payment_id: payment.id,
        })
    }

    pub async fn confirm_product_payment(&self, payment_id: &str) -> ApiResult<ProductPaymentState> {
        let payment = self.payments.find_payment(payment_id).await?;
        let status = payment.status.as_str().to_string();
        if payment.status != PaymentStatus::Succeeded {
            return Ok(ProductPaymentState {
                status,
                product: None,
                expiry_date: None,
            });
        }
        let order = ProductOrder::from_metadata(&payment.metadata)?;

        let _guard = self.locks.lock(&format!("payment:{}", payment.id)).await;
        if self.store.payment_recorded(&payment.id).await? {
            info!("Product payment {} already applied", payment.id);
            return Ok(ProductPaymentState {
                status,
                product: Some(order.product),
                expiry_date: None,
            });
        }

        let now = now_seconds();
        let key = product_key(&order.product);
        let expiry = self
            .store
            .upsert_product(order.tg_id, key, &order.login, order.days, now)
            .await?;

        self.notifier
            .notify(&format!(
                "Paid order\nProduct: {}\nLogin: {}\nPassword: {}\nDays: {}\nTelegram ID: {}\nPayment: {}",
                order.product, order.login, order.password, order.days, order.tg_id, payment.id
            ))
            .await;

        self.store
            .add_payment(&PaymentRecord {
                telegram_id: order.tg_id,
                label: payment.id.clone(),
                operation_type: key.to_string(),
                payment_time: now,
                amount: payment.amount.value.clone(),
                email: order.login.clone(),
            })
            .await?;

        Ok(ProductPaymentState {
            status,
            product: Some(order.product),
            expiry_date: Some(format_db_time(expiry)),
        })
    }

    /// Only a pending payment is cancelled; any other status is reported as is.
    pub async fn cancel_payment(&self, payment_id: &str) -> ApiResult<StatusResponse> {
        let payment = self.payments.find_payment(payment_id).await?;
        if payment.status != PaymentStatus::Pending {
            return Ok(StatusResponse {
                status: payment.status.as_str().to_string(),
            });
        }
        self.payments.cancel_payment(payment_id).await?;
        info!("Payment {} cancelled", payment_id);
        Ok(StatusResponse {
            status: "cancelled".to_string(),
        })
    }

    pub async fn activate_trial(&self, tg_id: i64) -> ApiResult<TrialActivated> {
        let _guard = self.locks.lock(&format!("trial:{}", tg_id)).await;
        if self.store.trial_used(tg_id).await? {
            return Err(ApiError::conflict("Trial already used"));
        }

        let email = SubscriptionClass::Trial.new_label(tg_id);
        let mut log = StepLog::new(email.clone());
        let result = async {
            let provisioned = self
                .reconciler
                .provision(tg_id, &email, now_seconds() + days(TRIAL_DAYS), &mut log)
                .await?;
            let expiry = provisioned.expiry();
            log.track(
                Step::PersistSubscription,
                self.store
                    .add_subscription(tg_id, &email, &provisioned.panel, expiry)
                    .await,
            )?;
            log.track(Step::MarkTrialUsed, self.store.mark_trial_used(tg_id).await)?;
            Ok::<_, ApiError>(TrialActivated {
                email: email.clone(),
                panel: provisioned.panel,
                key: provisioned.key,
                sub_url: provisioned.sub_link,
                expiry_date: format_db_time(expiry),
                days: TRIAL_DAYS,
            })
        }
        .await;
        log.finish();
        result
    }

    pub async fn submit_order(&self, req: SubmitOrderRequest) -> ApiResult<OrderSubmitted> {
        if req.login.trim().is_empty() || req.password.is_empty() {
            return Err(ApiError::validation("Login and password are required"));
        }
        check_order_days(req.days)?;

        self.notifier
            .notify(&format!(
                "New order\nProduct: {}\nLogin: {}\nPassword: {}\nDays: {}\nTelegram ID: {}",
                req.product, req.login, req.password, req.days, req.telegram_id
            ))
            .await;

        let key = product_key(&req.product);
        let expiry = self
            .store
            .upsert_product(req.telegram_id, key, &req.login, req.days, now_seconds())
            .await?;
        info!("Order stored: {} for {}", key, req.login);
        Ok(OrderSubmitted {
            status: "ok".to_string(),
            product: key.to_string(),
            expiry_date: format_db_time(expiry),
        })
    }

    pub async fn apply_referral_bonus(&self, req: ReferralBonusRequest) -> ApiResult<BonusApplied> {
        let referrer = req.tg_id;
        let _guard = self
            .locks
            .lock(&format!("referral:{}:{}", referrer, req.referee_id))
            .await;

        let referee = req.referee_id.to_string();
        let pair = self
            .store
            .referrals(referrer)
            .await?
            .into_iter()
            .find(|r| r.referee_id == referee)
            .ok_or_else(|| ApiError::not_found("Referral not found"))?;
        if pair.bonus_applied {
            return Err(ApiError::conflict("Bonus already applied"));
        }

        let subscriptions: Vec<ActiveSubscription> = self
            .reconciler
            .subscriptions_for(referrer)
            .await
            .into_iter()
            .filter(|s| !is_trial(&s.email))
            .collect();
        let target = bonus_target(&subscriptions, req.email.as_deref())?;

        let label = match &target {
            BonusTarget::Create => SubscriptionClass::ReferralBonus.new_label(referrer),
            BonusTarget::Extend(sub) => sub.email.clone(),
        };
        let mut log = StepLog::new(format!("referral bonus {} -> {}", referee, label));
        let result = self
            .grant_bonus(referrer, req.referee_id, &target, &label, &mut log)
            .await;
        log.finish();
        result
    }

    async fn grant_bonus(
        &self,
        referrer: i64,
        referee: i64,
        target: &BonusTarget<'_>,
        email: &str,
        log: &mut StepLog,
    ) -> ApiResult<BonusApplied> {
        let now = now_seconds();
        let (action, expiry) = match target {
            BonusTarget::Create => {
                let provisioned = self
                    .reconciler
                    .provision(referrer, email, now + days(REFERRAL_BONUS_DAYS), log)
                    .await?;
                let expiry = provisioned.expiry();
                log.track(
                    Step::PersistSubscription,
                    self.store
                        .add_subscription(referrer, email, &provisioned.panel, expiry)
                        .await,
                )?;
                (BonusAction::Created, expiry)
            }
            BonusTarget::Extend(sub) => {
                // Serialised with payment confirmation on the same email.
                let _email_guard = self.locks.lock(email).await;
                let extended = self
                    .reconciler
                    .extend(&sub.panel, email, referrer, REFERRAL_BONUS_DAYS, log)
                    .await?;
                log.track(
                    Step::PersistSubscription,
                    self.store
                        .upsert_subscription(referrer, email, &extended.panel, extended.expiry)
                        .await,
                )?;
                (BonusAction::Extended, extended.expiry)
            }
        };

        let marked = log.track(
            Step::MarkBonusApplied,
            self.store.mark_bonus_applied(referrer, referee, now).await,
        )?;
        if !marked {
            warn!(
                "Referral pair {} -> {} was already marked when the bonus landed on {}",
                referrer, referee, email
            );
        }

        let record = PaymentRecord {
            telegram_id: referrer,
            label: REFERRAL_BONUS_LABEL.to_string(),
            operation_type: "referral_bonus".to_string(),
            payment_time: now,
            amount: "0".to_string(),
            email: email.to_string(),
        };
        log.track(Step::RecordPayment, self.store.add_payment(&record).await)?;

        Ok(BonusApplied {
            action,
            email: email.to_string(),
            expiry_date: format_db_time(expiry),
        })
    }

    pub async fn reauthenticate_panels(&self) -> Vec<ReauthOutcome> {
        self.reconciler
            .registry()
            .authenticate_all()
            .await
            .into_iter()
            .map(|(panel, result)| ReauthOutcome {
                panel,
                ok: result.is_ok(),
                error: result.err().map(|e| e.to_string()),
            })
            .collect()
    }

    pub async fn delete_subscription(&self, panel: &str, email: &str) -> ApiResult<Removed> {
        let _guard = self.locks.lock(email).await;
        let mut log = StepLog::new(format!("admin delete {}", email));
        let result = self.reconciler.remove(panel, email, &mut log).await;
        log.finish();
        Ok(Removed {
            email: email.to_string(),
            removed: result?,
        })
    }
}
