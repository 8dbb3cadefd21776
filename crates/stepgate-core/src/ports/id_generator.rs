//! IdGenerator port.

use ulid::Ulid;

use crate::domain::WorkerId;
use crate::ports::Clock;

pub trait IdGenerator: Send + Sync {
    fn generate_worker_id(&self) -> WorkerId;
}

/// ULID generator whose timestamp part comes from a `Clock`.
pub struct UlidGenerator<C> {
    clock: C,
}

impl<C: Clock> UlidGenerator<C> {
    pub fn new(clock: C) -> Self {
        Self { clock }
    }
}

impl<C: Clock> IdGenerator for UlidGenerator<C> {
    fn generate_worker_id(&self) -> WorkerId {
        let timestamp_ms = self.clock.now().timestamp_millis() as u64;
        WorkerId::from(Ulid::from_parts(timestamp_ms, rand::random()))
    }
}
