pub mod nats;
pub mod postgres;

#[cfg(test)]
pub mod memory;
