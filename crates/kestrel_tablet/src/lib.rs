pub mod bootstrap;
pub mod clock;
pub mod kv;
pub mod lock;
pub mod maintenance;
pub mod metadata;
pub mod mvcc;
pub mod ops;
pub mod rowset;
pub mod tablet;
pub mod txn_participant;
pub mod wal;
