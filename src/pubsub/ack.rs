/// Outcome a handler reports for one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AckType {
    /// Processed; remove from the queue.
    Ack,
    /// Not processed; hand it back to the broker for redelivery.
    NackRequeue,
    /// Rejected for good; dropped, or dead-lettered if the queue has a salvage exchange.
    NackDiscard,
}

impl AckType {
    /// `Some(requeue)` for the two negative outcomes.
    pub fn requeue(self) -> Option<bool> {
        match self {
            AckType::Ack => None,
            AckType::NackRequeue => Some(true),
            AckType::NackDiscard => Some(false),
        }
    }
}
