use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const DEFAULT_CURRENCY: &str = "USD";

/// The tenant's company profile as stored in the `companies` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompanyProfile {
  pub id: String,
  pub name: String,
  pub owner_id: String,
  #[serde(default)]
  pub email: Option<String>,
  #[serde(default)]
  pub phone: Option<String>,
  #[serde(default)]
  pub address: Option<String>,
  #[serde(default)]
  pub tax_id: Option<String>,
  #[serde(default = "default_currency")]
  pub currency: String,
}

fn default_currency() -> String {
  DEFAULT_CURRENCY.to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
  Owner,
  Admin,
  Manager,
  Member,
  Viewer,
}

impl Role {
  /// Roles allowed to modify the company regardless of ownership.
  pub fn can_manage_company(self) -> bool {
    matches!(self, Role::Owner | Role::Admin)
  }
}

/// Authenticated principal, already available without a network round trip.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
  pub user_id: String,
  pub email: String,
  #[serde(default)]
  pub display_name: Option<String>,
  #[serde(default)]
  pub company_id: Option<String>,
  #[serde(default)]
  pub company_name: Option<String>,
  pub role: Role,
}

impl Session {
  /// Synthetic profile built from session data only.
  ///
  /// Used when the backend cannot be reached, and as the seed row when the
  /// company is missing and has to be created.
  pub fn fallback_profile(&self) -> Option<CompanyProfile> {
    let id = self.company_id.clone()?;
    let name = self
      .company_name
      .clone()
      .filter(|n| !n.trim().is_empty())
      .unwrap_or_else(|| {
        let who = self
          .display_name
          .clone()
          .filter(|n| !n.trim().is_empty())
          .unwrap_or_else(|| self.email.split('@').next().unwrap_or_default().to_string());
        format!("{}'s company", who)
      });

    Some(CompanyProfile {
      id,
      name,
      owner_id: self.user_id.clone(),
      email: Some(self.email.clone()),
      phone: None,
      address: None,
      tax_id: None,
      currency: default_currency(),
    })
  }
}

/// A partial update of the profile. `None` leaves a field unchanged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProfileChanges {
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub name: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub email: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub phone: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub address: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub tax_id: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub currency: Option<String>,
}

impl ProfileChanges {
  pub fn is_empty(&self) -> bool {
    *self == Self::default()
  }

  /// The profile as it will look once the change is applied.
  pub fn apply(&self, profile: &CompanyProfile) -> CompanyProfile {
    let mut next = profile.clone();
    if let Some(name) = &self.name {
      next.name = name.clone();
    }
    if let Some(email) = &self.email {
      next.email = Some(email.clone());
    }
    if let Some(phone) = &self.phone {
      next.phone = Some(phone.clone());
    }
    if let Some(address) = &self.address {
      next.address = Some(address.clone());
    }
    if let Some(tax_id) = &self.tax_id {
      next.tax_id = Some(tax_id.clone());
    }
    if let Some(currency) = &self.currency {
      next.currency = currency.clone();
    }
    next
  }

  /// Mutation payload: the row id plus the changed fields.
  pub fn payload(&self, company_id: &str) -> Value {
    let mut row = match serde_json::to_value(self) {
      Ok(Value::Object(fields)) => fields,
      _ => Map::new(),
    };
    row.insert("id".to_string(), Value::String(company_id.to_string()));
    Value::Object(row)
  }
}
