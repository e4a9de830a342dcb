pub mod health;
pub mod packets;
