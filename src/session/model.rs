//! Session record types
//!
//! A session owns four independently mutable sections. Every type here is
//! plain data: callers always receive clones, never references into the
//! stored record.

use crate::error::{PaymentValidationError, StateError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Unique session identifier (opaque to the core)
pub type SessionId = String;

/// Tolerance used when comparing money amounts
pub const CENT_TOLERANCE: f64 = 0.01 + 1e-9;

/// Round an amount to whole cents
pub fn round_cents(amount: f64) -> f64 {
    (amount * 100.0).round() / 100.0
}

/// Conversation phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    #[default]
    Greeting,
    OrderTaking,
    SmallTalk,
    ReorderPrompt,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Greeting => write!(f, "greeting"),
            Phase::OrderTaking => write!(f, "order_taking"),
            Phase::SmallTalk => write!(f, "small_talk"),
            Phase::ReorderPrompt => write!(f, "reorder_prompt"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct ConversationState {
    pub phase: Phase,
    pub turn_count: u64,
    pub small_talk_count: u32,
    /// Turn index at which the last order was placed
    pub last_order_time: Option<u64>,
}

/// One ordered item
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineItem {
    pub name: String,
    pub unit_price: f64,
    #[serde(default)]
    pub modifiers: Vec<String>,
    #[serde(default = "default_quantity")]
    pub quantity: u32,
}

fn default_quantity() -> u32 {
    1
}

impl LineItem {
    pub fn new(name: impl Into<String>, unit_price: f64) -> Self {
        Self {
            name: name.into(),
            unit_price,
            modifiers: Vec::new(),
            quantity: 1,
        }
    }

    pub fn with_quantity(mut self, quantity: u32) -> Self {
        self.quantity = quantity;
        self
    }

    pub fn with_modifier(mut self, modifier: impl Into<String>) -> Self {
        self.modifiers.push(modifier.into());
        self
    }

    /// Line price (unit price times quantity, in cents precision)
    pub fn price(&self) -> f64 {
        round_cents(self.unit_price * f64::from(self.quantity))
    }
}

/// Everything ordered on the current tab
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct OrderHistory {
    pub items: Vec<LineItem>,
    pub total_cost: f64,
    pub tip_amount: f64,
    pub tip_percentage: Option<f64>,
    pub paid: bool,
}

impl OrderHistory {
    /// Sum of line prices, in item order
    pub fn items_total(&self) -> f64 {
        self.items.iter().map(LineItem::price).sum()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct OrderState {
    pub current_order: Vec<LineItem>,
    pub order_history: OrderHistory,
    pub finished: bool,
}

impl OrderState {
    pub fn status(&self) -> PaymentStatus {
        if self.order_history.paid {
            PaymentStatus::Paid
        } else {
            PaymentStatus::Open
        }
    }
}

/// Payment lifecycle of a tab
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentStatus {
    Open,
    Paid,
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PaymentStatus::Open => write!(f, "open"),
            PaymentStatus::Paid => write!(f, "paid"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PaymentState {
    pub tab_total: f64,
    pub balance: f64,
    pub tip_percentage: Option<f64>,
    pub tip_amount: f64,
    /// Optimistic concurrency token, advanced on every order/payment write
    #[serde(default)]
    pub version: u64,
}

impl PaymentState {
    pub fn with_balance(balance: f64) -> Self {
        Self {
            tab_total: 0.0,
            balance,
            tip_percentage: None,
            tip_amount: 0.0,
            version: 0,
        }
    }

    /// Amount owed when the tab is settled
    pub fn total_due(&self) -> f64 {
        round_cents(self.tab_total + self.tip_amount)
    }

    /// Recompute the tip from its percentage, if one is set
    pub fn refresh_tip(&mut self) {
        if let Some(pct) = self.tip_percentage {
            self.tip_amount = round_cents(pct / 100.0 * self.tab_total);
        }
    }

    /// Check the amount, percentage and tip invariants
    pub fn validate(&self) -> Result<(), PaymentValidationError> {
        for (field, value) in [
            ("tab_total", self.tab_total),
            ("tip_amount", self.tip_amount),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(PaymentValidationError::InvalidAmount { field, value });
            }
        }
        if !self.balance.is_finite() {
            return Err(PaymentValidationError::InvalidAmount {
                field: "balance",
                value: self.balance,
            });
        }
        if self.balance < 0.0 {
            return Err(PaymentValidationError::NegativeBalance(self.balance));
        }
        if let Some(pct) = self.tip_percentage {
            if !(0.0..=100.0).contains(&pct) {
                return Err(PaymentValidationError::TipPercentageOutOfRange(pct));
            }
            let expected = round_cents(pct / 100.0 * self.tab_total);
            if (expected - self.tip_amount).abs() > CENT_TOLERANCE {
                return Err(PaymentValidationError::TipMismatch {
                    tip_amount: self.tip_amount,
                    tip_percentage: pct,
                    tab_total: self.tab_total,
                });
            }
        }
        Ok(())
    }
}

/// Validated bring-your-own-key material.
///
/// `Debug` never prints the material.
#[derive(Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct CredentialState {
    pub material: Option<String>,
    pub validated: bool,
}

impl fmt::Debug for CredentialState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialState")
            .field("material", &self.material.as_ref().map(|_| "<redacted>"))
            .field("validated", &self.validated)
            .finish()
    }
}

/// Complete stored record of one session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub conversation: ConversationState,
    pub order: OrderState,
    pub payment: PaymentState,
    #[serde(default)]
    pub credentials: CredentialState,
}

impl SessionRecord {
    /// Fresh record with every section at its default
    pub fn new(default_balance: f64) -> Self {
        Self {
            conversation: ConversationState::default(),
            order: OrderState::default(),
            payment: PaymentState::with_balance(default_balance),
            credentials: CredentialState::default(),
        }
    }

    /// Advance the optimistic concurrency token
    pub fn bump_version(&mut self) -> u64 {
        self.payment.version += 1;
        self.payment.version
    }

    /// Sections whose contents differ between `self` and `other`
    pub fn changed_sections(&self, other: &SessionRecord) -> Vec<Section> {
        Section::ALL
            .into_iter()
            .filter(|section| match section {
                Section::Conversation => self.conversation != other.conversation,
                Section::Order => self.order != other.order,
                Section::Payment => self.payment != other.payment,
                Section::Credentials => self.credentials != other.credentials,
            })
            .collect()
    }

    /// Overwrite one section with the contents of `from`
    pub fn copy_section(&mut self, section: Section, from: &SessionRecord) {
        match section {
            Section::Conversation => self.conversation = from.conversation.clone(),
            Section::Order => self.order = from.order.clone(),
            Section::Payment => self.payment = from.payment.clone(),
            Section::Credentials => self.credentials = from.credentials.clone(),
        }
    }

    /// Serialize one section to a JSON object
    pub fn section_value(&self, section: Section) -> Result<serde_json::Value, StateError> {
        let value = match section {
            Section::Conversation => serde_json::to_value(&self.conversation),
            Section::Order => serde_json::to_value(&self.order),
            Section::Payment => serde_json::to_value(&self.payment),
            Section::Credentials => serde_json::to_value(&self.credentials),
        };
        value.map_err(|e| StateError::Store(e.into()))
    }

    /// Shallow-merge `partial` into one section.
    ///
    /// Keys absent from `partial` keep their stored value. The payment
    /// section's version token is never taken from a partial update.
    pub fn merge_section(
        &mut self,
        section: Section,
        partial: &serde_json::Value,
    ) -> Result<(), StateError> {
        let invalid = |message: String| StateError::InvalidUpdate {
            section: section.to_string(),
            message,
        };
        let serde_json::Value::Object(updates) = partial else {
            return Err(invalid("partial update must be a JSON object".to_string()));
        };

        let mut current = self.section_value(section)?;
        let serde_json::Value::Object(fields) = &mut current else {
            return Err(invalid("stored section is not an object".to_string()));
        };
        for (key, value) in updates {
            if section == Section::Payment && key == "version" {
                continue;
            }
            fields.insert(key.clone(), value.clone());
        }

        match section {
            Section::Conversation => {
                self.conversation =
                    serde_json::from_value(current).map_err(|e| invalid(e.to_string()))?;
            }
            Section::Order => {
                self.order = serde_json::from_value(current).map_err(|e| invalid(e.to_string()))?;
            }
            Section::Payment => {
                self.payment =
                    serde_json::from_value(current).map_err(|e| invalid(e.to_string()))?;
            }
            Section::Credentials => {
                self.credentials =
                    serde_json::from_value(current).map_err(|e| invalid(e.to_string()))?;
            }
        }
        Ok(())
    }
}

/// Named section of a session record
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Section {
    Conversation,
    Order,
    Payment,
    Credentials,
}

impl Section {
    pub const ALL: [Section; 4] = [
        Section::Conversation,
        Section::Order,
        Section::Payment,
        Section::Credentials,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Section::Conversation => "conversation",
            Section::Order => "order",
            Section::Payment => "payment",
            Section::Credentials => "credentials",
        }
    }

    /// Order and payment writes advance the version token
    pub fn is_versioned(self) -> bool {
        matches!(self, Section::Order | Section::Payment)
    }
}

impl fmt::Display for Section {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Section {
    type Err = StateError;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        Section::ALL
            .into_iter()
            .find(|s| s.as_str() == name)
            .ok_or_else(|| StateError::SectionNotFound(name.to_string()))
    }
}
