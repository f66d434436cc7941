//! Client email labels. The prefix of a label is the subscription class
//! and drives the business rules (trials cannot be renewed).

use rand::Rng;
use uuid::Uuid;

const USER_PREFIX: &str = "DE-FRA-USER-";
const TRIAL_PREFIX: &str = "DE-FRA-TRIAL-";
const REFERRAL_PREFIX: &str = "DE-FRA-REF-";

const SUB_ID_CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
const SUB_ID_LEN: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionClass {
    User,
    Trial,
    ReferralBonus,
}

impl SubscriptionClass {
    pub fn prefix(self) -> &'static str {
        match self {
            SubscriptionClass::User => USER_PREFIX,
            SubscriptionClass::Trial => TRIAL_PREFIX,
            SubscriptionClass::ReferralBonus => REFERRAL_PREFIX,
        }
    }

    pub fn of(email: &str) -> Option<Self> {
        [
            SubscriptionClass::User,
            SubscriptionClass::Trial,
            SubscriptionClass::ReferralBonus,
        ]
        .into_iter()
        .find(|class| email.starts_with(class.prefix()))
    }

    /// Fresh label for `tg_id`, e.g. `DE-FRA-USER-42-1a2b3c`.
    pub fn new_label(self, tg_id: i64) -> String {
        let suffix = Uuid::new_v4().simple().to_string();
        format!("{}{}-{}", self.prefix(), tg_id, &suffix[..6])
    }
}

pub fn is_trial(email: &str) -> bool {
    email.starts_with(TRIAL_PREFIX)
}

/// Random `[a-z0-9]{16}` id used in the shareable subscription URL.
pub fn generate_sub_id() -> String {
    let mut rng = rand::thread_rng();
    (0..SUB_ID_LEN)
        .map(|_| SUB_ID_CHARSET[rng.gen_range(0..SUB_ID_CHARSET.len())] as char)
        .collect()
}
