//! Transaction handle threaded through storage operations.
//!
//! Concurrency control lives with the structures themselves (the hash
//! table carries its own latches); the handle exists so every operation
//! names the transaction it runs under and nested calls can forward it.

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TxnId(pub u64);

/// Opaque per-operation context passed through index operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transaction {
    id: TxnId,
}

impl Transaction {
    pub fn new(id: TxnId) -> Self {
        Self { id }
    }

    pub fn id(&self) -> TxnId {
        self.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transaction_carries_its_id() {
        let txn = Transaction::new(TxnId(7));
        assert_eq!(txn.id(), TxnId(7));
    }
}
