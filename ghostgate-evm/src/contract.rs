//! Credit ledger contract bindings.

use alloy_sol_types::sol;

sol! {
    /// Minimal interface of the credit ledger contract.
    ///
    /// Only the deposit event is declared; the contract tracks aggregate value
    /// per beneficiary, so credits are derived off-chain from these events.
    #[allow(missing_docs)]
    #[derive(Debug, PartialEq, Eq)]
    interface ICreditLedger {
        event Deposited(address indexed agent, address indexed payer, uint256 amount);
    }
}
