//! Session lifetime computations.
//!
//! Every query takes an explicit `now`; nothing here schedules timers.

use chrono::{DateTime, Duration, Utc};
use eduvpn_config::SessionSection;

/// Validity window of an issued VPN configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionValidity {
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    renew_after: Duration,
    pending_fraction: f64,
    pending_lead: Duration,
    notification_leads: Vec<Duration>,
}

impl SessionValidity {
    /// Window with the default thresholds.
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self::from_config(start, end, &SessionSection::default())
    }

    pub fn from_config(start: DateTime<Utc>, end: DateTime<Utc>, config: &SessionSection) -> Self {
        Self {
            start,
            end,
            renew_after: Duration::minutes(config.renew_after_minutes),
            pending_fraction: config.pending_expiry_fraction,
            pending_lead: Duration::minutes(config.pending_expiry_lead_minutes),
            notification_leads: config
                .notification_leads_minutes
                .iter()
                .map(|m| Duration::minutes(*m))
                .collect(),
        }
    }

    pub fn start(&self) -> DateTime<Utc> {
        self.start
    }

    pub fn end(&self) -> DateTime<Utc> {
        self.end
    }

    pub fn duration(&self) -> Duration {
        self.end - self.start
    }

    /// Time until the end; negative once expired.
    pub fn remaining(&self, now: DateTime<Utc>) -> Duration {
        self.end - now
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.end
    }

    /// `max(start + fraction * duration, end - lead)`.
    pub fn pending_expiry_time(&self) -> DateTime<Utc> {
        let fraction_ms = self.duration().num_milliseconds() as f64 * self.pending_fraction;
        let by_fraction = self.start + Duration::milliseconds(fraction_ms.round() as i64);
        let by_lead = self.end - self.pending_lead;
        by_fraction.max(by_lead)
    }

    pub fn is_pending_expiry(&self, now: DateTime<Utc>) -> bool {
        now >= self.pending_expiry_time()
    }

    /// When renewing becomes available.
    pub fn renew_button_time(&self) -> DateTime<Utc> {
        self.start + self.renew_after
    }

    pub fn is_renew_button_visible(&self, now: DateTime<Utc>) -> bool {
        now >= self.renew_button_time()
    }

    /// Moments the user should be reminded of the expiry, oldest first.
    ///
    /// Leads reaching back before the start are dropped.
    pub fn notification_times(&self) -> Vec<DateTime<Utc>> {
        let mut times: Vec<_> = self
            .notification_leads
            .iter()
            .map(|lead| self.end - *lead)
            .filter(|t| *t > self.start)
            .collect();
        times.sort();
        times.dedup();
        times
    }

    /// First notification strictly after `now`.
    pub fn next_notification(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.notification_times().into_iter().find(|t| *t > now)
    }

    /// Notifications that fell due in `(since, now]`.
    pub fn notifications_due(&self, since: DateTime<Utc>, now: DateTime<Utc>) -> Vec<DateTime<Utc>> {
        self.notification_times()
            .into_iter()
            .filter(|t| *t > since && *t <= now)
            .collect()
    }

    pub fn remaining_now(&self) -> Duration {
        self.remaining(Utc::now())
    }

    pub fn is_expired_now(&self) -> bool {
        self.is_expired(Utc::now())
    }

    pub fn is_pending_expiry_now(&self) -> bool {
        self.is_pending_expiry(Utc::now())
    }
}
