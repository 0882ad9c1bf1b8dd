pub mod batch;
pub mod customer;
pub mod event;
pub mod tenant;
pub mod transaction;
pub mod wallet;
