//! The ETH free balance.
//!
//! A two-party bucket app whose state records how much of the multisig's
//! funds each owner has not yet committed to an app.

use sc_abi::{encode, AbiReader, Token};
use sc_crypto::Address;
use serde::{Deserialize, Serialize};

use crate::error::{MachineError, MachineResult};

/// State encoding of the free balance app.
pub const FREE_BALANCE_STATE_ENCODING: &str =
    "tuple(address alice, address bob, uint256 aliceBalance, uint256 bobBalance)";

/// Balances of the two owners. `alice` is always the lower owner address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FreeBalanceState {
    pub alice: Address,
    pub bob: Address,
    pub alice_balance: u128,
    pub bob_balance: u128,
}

impl FreeBalanceState {
    /// A zero balance between two owners, ordered.
    pub fn zero(a: Address, b: Address) -> Self {
        let (alice, bob) = if a <= b { (a, b) } else { (b, a) };
        Self {
            alice,
            bob,
            alice_balance: 0,
            bob_balance: 0,
        }
    }

    pub fn encode(&self) -> MachineResult<Vec<u8>> {
        Ok(encode(&[
            Token::Address(self.alice),
            Token::Address(self.bob),
            Token::Uint(self.alice_balance),
            Token::Uint(self.bob_balance),
        ])?)
    }

    pub fn decode(data: &[u8]) -> MachineResult<Self> {
        let mut reader = AbiReader::new(data);
        Ok(Self {
            alice: reader.read_address()?,
            bob: reader.read_address()?,
            alice_balance: reader.read_uint()?,
            bob_balance: reader.read_uint()?,
        })
    }

    /// Sum of both balances.
    pub fn total(&self) -> MachineResult<u128> {
        self.alice_balance
            .checked_add(self.bob_balance)
            .ok_or(MachineError::BalanceOverflow)
    }

    /// Balance of `owner`.
    pub fn balance_of(&self, owner: &Address) -> MachineResult<u128> {
        if *owner == self.alice {
            Ok(self.alice_balance)
        } else if *owner == self.bob {
            Ok(self.bob_balance)
        } else {
            Err(MachineError::NotAnOwner(*owner))
        }
    }

    /// Debit both owners, failing if either would go negative.
    pub fn decrement(&self, alice: u128, bob: u128) -> MachineResult<Self> {
        let debit = |owner: Address, available: u128, required: u128| {
            available
                .checked_sub(required)
                .ok_or(MachineError::InsufficientFunds {
                    owner,
                    available,
                    required,
                })
        };
        Ok(Self {
            alice_balance: debit(self.alice, self.alice_balance, alice)?,
            bob_balance: debit(self.bob, self.bob_balance, bob)?,
            ..self.clone()
        })
    }

    /// Credit both owners.
    pub fn increment(&self, alice: u128, bob: u128) -> MachineResult<Self> {
        Ok(Self {
            alice_balance: self
                .alice_balance
                .checked_add(alice)
                .ok_or(MachineError::BalanceOverflow)?,
            bob_balance: self
                .bob_balance
                .checked_add(bob)
                .ok_or(MachineError::BalanceOverflow)?,
            ..self.clone()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> FreeBalanceState {
        FreeBalanceState {
            alice: Address([1; 20]),
            bob: Address([2; 20]),
            alice_balance: 10,
            bob_balance: 5,
        }
    }

    #[test]
    fn test_zero_orders_owners() {
        let fb = FreeBalanceState::zero(Address([9; 20]), Address([3; 20]));
        assert_eq!(fb.alice, Address([3; 20]));
        assert_eq!(fb.total().unwrap(), 0);
    }

    #[test]
    fn test_encode_decode() {
        let fb = state();
        let encoded = fb.encode().unwrap();
        assert_eq!(encoded.len(), 128);
        assert_eq!(FreeBalanceState::decode(&encoded).unwrap(), fb);
    }

    #[test]
    fn test_decrement_insufficient() {
        let err = state().decrement(11, 0).unwrap_err();
        assert!(matches!(
            err,
            MachineError::InsufficientFunds {
                available: 10,
                required: 11,
                ..
            }
        ));
    }

    #[test]
    fn test_decrement_then_increment_conserves() {
        let fb = state();
        let after = fb.decrement(4, 4).unwrap().increment(3, 5).unwrap();
        assert_eq!(after.total().unwrap(), fb.total().unwrap());
        assert_eq!(after.alice_balance, 9);
        assert_eq!(after.bob_balance, 6);
    }

    #[test]
    fn test_balance_of_stranger() {
        assert!(state().balance_of(&Address([7; 20])).is_err());
    }
}
