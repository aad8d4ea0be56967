use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Last uuid issued, as milliseconds since the epoch; guarantees `next_uuid` is strictly
/// monotonic even when two orders arrive within the same millisecond.
static LAST_UUID_MILLIS: AtomicI64 = AtomicI64::new(0);

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Assigns an opaque, monotonic, millisecond-timestamp-shaped uuid.
pub fn next_uuid() -> String {
    let candidate = now_millis();
    let assigned = LAST_UUID_MILLIS.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
        Some(if candidate > last { candidate } else { last + 1 })
    });
    let value = assigned.unwrap_or(candidate).max(candidate);
    value.to_string()
}

/// Lifecycle status of an `Order`. Transitions: WAITING → PROCESSING (on first task
/// start) → COMPLETED | CANCELLED | FAILED. No transition ever goes backwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderStatus {
    Waiting,
    Processing,
    Completed,
    Cancelled,
    Failed,
}

/// A runtime work item.
#[derive(Debug, Clone)]
pub struct Order {
    pub uuid: String,
    pub order_no: i64,
    pub menu_code: i64,
    pub menu_name: String,
    pub status: OrderStatus,
    pub created_at_millis: i64,
    pub completed_at_millis: Option<i64>,
    /// Set when this order lost a parallel-interleave attempt, so
    /// `_check_parallel_opportunity_` will not retry it within the same session.
    pub parallel_skip: bool,
}

impl Order {
    /// Builds a new order with a fresh uuid, status WAITING, and `created_at` stamped now.
    pub fn new(order_no: i64, menu_code: i64, menu_name: &str) -> Self {
        Order {
            uuid: next_uuid(),
            order_no,
            menu_code,
            menu_name: menu_name.to_string(),
            status: OrderStatus::Waiting,
            created_at_millis: now_millis(),
            completed_at_millis: None,
            parallel_skip: false,
        }
    }

    pub fn mark_processing(&mut self) {
        self.status = OrderStatus::Processing;
    }

    pub fn mark_completed(&mut self) {
        self.status = OrderStatus::Completed;
        self.completed_at_millis = Some(now_millis());
    }

    pub fn mark_cancelled(&mut self) {
        self.status = OrderStatus::Cancelled;
    }

    pub fn mark_failed(&mut self) {
        self.status = OrderStatus::Failed;
    }

    /// Whether the status transition so far is a prefix of
    /// (WAITING, PROCESSING, {COMPLETED | CANCELLED | FAILED}).
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.status,
            OrderStatus::Completed | OrderStatus::Cancelled | OrderStatus::Failed
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_order_starts_waiting() {
        let order = Order::new(1, 101, "iced americano");
        assert_eq!(order.status, OrderStatus::Waiting);
        assert!(!order.is_terminal());
        assert!(order.completed_at_millis.is_none());
    }

    #[test]
    fn uuids_are_strictly_monotonic() {
        let a = next_uuid();
        let b = next_uuid();
        let c = next_uuid();
        assert!(a.parse::<i64>().unwrap() < b.parse::<i64>().unwrap());
        assert!(b.parse::<i64>().unwrap() < c.parse::<i64>().unwrap());
    }

    #[test]
    fn lifecycle_transitions_are_forward_only() {
        let mut order = Order::new(2, 202, "hot latte");
        order.mark_processing();
        assert_eq!(order.status, OrderStatus::Processing);
        order.mark_completed();
        assert_eq!(order.status, OrderStatus::Completed);
        assert!(order.is_terminal());
        assert!(order.completed_at_millis.is_some());
    }
}
