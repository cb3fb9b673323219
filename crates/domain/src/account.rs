use serde::{Deserialize, Serialize};

use eventide_core::{Aggregate, DomainError, DomainEvent, DomainResult};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountStatus {
    #[default]
    Unopened,
    Open,
    Closed,
}

/// Aggregate root: Account (domain `banking`).
///
/// Balances are whole minor units and never go negative.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    status: AccountStatus,
    owner: String,
    balance: u64,
}

impl Account {
    pub fn status(&self) -> AccountStatus {
        self.status
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn balance(&self) -> u64 {
        self.balance
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AccountCommand {
    Open { owner: String },
    Deposit { amount: u64 },
    Withdraw { amount: u64 },
    Close,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccountEvent {
    Opened { owner: String },
    Deposited { amount: u64 },
    Withdrawn { amount: u64 },
    Closed,
}

impl DomainEvent for AccountEvent {
    fn event_type(&self) -> &'static str {
        match self {
            AccountEvent::Opened { .. } => "account.opened",
            AccountEvent::Deposited { .. } => "account.deposited",
            AccountEvent::Withdrawn { .. } => "account.withdrawn",
            AccountEvent::Closed => "account.closed",
        }
    }
}

impl Aggregate for Account {
    const AGGREGATE_TYPE: &'static str = "account";
    const DOMAIN: &'static str = "banking";

    type Command = AccountCommand;
    type Event = AccountEvent;

    fn apply(&mut self, event: &AccountEvent) {
        match event {
            AccountEvent::Opened { owner } => {
                self.status = AccountStatus::Open;
                self.owner = owner.clone();
            }
            AccountEvent::Deposited { amount } => {
                self.balance = self.balance.saturating_add(*amount);
            }
            AccountEvent::Withdrawn { amount } => {
                self.balance = self.balance.saturating_sub(*amount);
            }
            AccountEvent::Closed => self.status = AccountStatus::Closed,
        }
    }

    fn decide(&self, command: &AccountCommand) -> DomainResult<Vec<AccountEvent>> {
        if self.status == AccountStatus::Closed {
            return Err(DomainError::transition("account is already closed"));
        }

        match command {
            AccountCommand::Open { owner } => self.handle_open(owner),
            AccountCommand::Deposit { amount } => {
                self.ensure_open()?;
                ensure_positive(*amount)?;
                if self.balance.checked_add(*amount).is_none() {
                    return Err(DomainError::invariant("balance would overflow"));
                }
                Ok(vec![AccountEvent::Deposited { amount: *amount }])
            }
            AccountCommand::Withdraw { amount } => {
                self.ensure_open()?;
                ensure_positive(*amount)?;
                if *amount > self.balance {
                    return Err(DomainError::invariant(format!(
                        "insufficient funds (balance {}, requested {amount})",
                        self.balance
                    )));
                }
                Ok(vec![AccountEvent::Withdrawn { amount: *amount }])
            }
            AccountCommand::Close => {
                self.ensure_open()?;
                if self.balance != 0 {
                    return Err(DomainError::invariant(format!(
                        "cannot close account with non-zero balance ({})",
                        self.balance
                    )));
                }
                Ok(vec![AccountEvent::Closed])
            }
        }
    }
}

impl Account {
    fn ensure_open(&self) -> DomainResult<()> {
        match self.status {
            AccountStatus::Open => Ok(()),
            AccountStatus::Unopened => Err(DomainError::not_found("account has not been opened")),
            AccountStatus::Closed => Err(DomainError::transition("account is already closed")),
        }
    }

    fn handle_open(&self, owner: &str) -> DomainResult<Vec<AccountEvent>> {
        if self.status != AccountStatus::Unopened {
            return Err(DomainError::transition("account is already open"));
        }
        let owner = owner.trim();
        if owner.is_empty() {
            return Err(DomainError::validation("owner cannot be empty"));
        }
        Ok(vec![AccountEvent::Opened {
            owner: owner.to_string(),
        }])
    }
}

fn ensure_positive(amount: u64) -> DomainResult<()> {
    if amount == 0 {
        return Err(DomainError::validation("amount must be greater than zero"));
    }
    Ok(())
}
