//! Optional write-behind persistence (§3 supplement). A cache node can run
//! purely in memory, or attach a `Store` so committed entries survive a
//! restart. The entry store calls `put`/`remove` after a write is already
//! visible in memory — persistence is best-effort and asynchronous to the
//! client response, never on the hot path of a `get`.

pub mod disk;
pub mod memory;

use crate::error::CResult;

/// A durable key/value sink. Mirrors the storage engine's `get`/`set`/
/// `delete` shape, but speaks whole values rather than iterators: the
/// persistence layer never needs to scan, only to replay on startup.
pub trait Store: Send + Sync {
    fn load(&mut self, key: &[u8]) -> CResult<Option<Vec<u8>>>;

    fn put(&mut self, key: &[u8], value: Vec<u8>) -> CResult<()>;

    fn remove(&mut self, key: &[u8]) -> CResult<()>;

    /// Replays every live key/value pair, e.g. to warm the entry store on
    /// node startup before it starts accepting requests.
    fn load_all(&mut self) -> CResult<Vec<(Vec<u8>, Vec<u8>)>>;

    fn flush(&mut self) -> CResult<()>;
}
