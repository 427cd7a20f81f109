//! Data models for Service Maps
//!
//! Defines the mirrored entities of the field-service hierarchy
//! (territory → address → house → visit), the parallel phone hierarchy,
//! access keys and recalls, together with the identity types used to
//! address them in the local cache and on the wire.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Every entity kind mirrored in the local cache
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Territory,
    TerritoryAddress,
    House,
    Visit,
    PhoneTerritory,
    PhoneNumber,
    PhoneCall,
    Token,
    TokenTerritory,
    UserToken,
    Recall,
}

impl EntityKind {
    /// All kinds, parents before children
    pub const ALL: [EntityKind; 11] = [
        EntityKind::Territory,
        EntityKind::TerritoryAddress,
        EntityKind::House,
        EntityKind::Visit,
        EntityKind::PhoneTerritory,
        EntityKind::PhoneNumber,
        EntityKind::PhoneCall,
        EntityKind::Token,
        EntityKind::TokenTerritory,
        EntityKind::UserToken,
        EntityKind::Recall,
    ];

    /// Wire and storage name of the kind
    pub fn as_str(self) -> &'static str {
        match self {
            EntityKind::Territory => "territory",
            EntityKind::TerritoryAddress => "territory_address",
            EntityKind::House => "house",
            EntityKind::Visit => "visit",
            EntityKind::PhoneTerritory => "phone_territory",
            EntityKind::PhoneNumber => "phone_number",
            EntityKind::PhoneCall => "phone_call",
            EntityKind::Token => "token",
            EntityKind::TokenTerritory => "token_territory",
            EntityKind::UserToken => "user_token",
            EntityKind::Recall => "recall",
        }
    }

    /// SQLite table holding rows of this kind
    pub fn table(self) -> &'static str {
        match self {
            EntityKind::Territory => "territories",
            EntityKind::TerritoryAddress => "territory_addresses",
            EntityKind::House => "houses",
            EntityKind::Visit => "visits",
            EntityKind::PhoneTerritory => "phone_territories",
            EntityKind::PhoneNumber => "phone_numbers",
            EntityKind::PhoneCall => "phone_calls",
            EntityKind::Token => "tokens",
            EntityKind::TokenTerritory => "token_territories",
            EntityKind::UserToken => "user_tokens",
            EntityKind::Recall => "recalls",
        }
    }

    /// Primary key columns, in the order they appear in a [`RecordKey::Pair`]
    pub fn key_columns(self) -> &'static [&'static str] {
        match self {
            EntityKind::TokenTerritory => &["token", "territory"],
            EntityKind::UserToken => &["token", "user_id"],
            EntityKind::Recall => &["user", "house"],
            _ => &["id"],
        }
    }

    /// Whether rows of this kind are addressed by a composite key
    pub fn is_composite(self) -> bool {
        self.key_columns().len() == 2
    }

    /// Kind whose rows must exist before a row of this kind can be stored
    ///
    /// Recalls and the territory side of a token grant are loose references:
    /// they may point outside the caller's scope and are not enforced.
    pub fn parent(self) -> Option<EntityKind> {
        match self {
            EntityKind::TerritoryAddress => Some(EntityKind::Territory),
            EntityKind::House => Some(EntityKind::TerritoryAddress),
            EntityKind::Visit => Some(EntityKind::House),
            EntityKind::PhoneNumber => Some(EntityKind::PhoneTerritory),
            EntityKind::PhoneCall => Some(EntityKind::PhoneNumber),
            EntityKind::TokenTerritory | EntityKind::UserToken => Some(EntityKind::Token),
            _ => None,
        }
    }

    /// Column on this kind's table referencing the parent row
    pub fn parent_column(self) -> Option<&'static str> {
        match self {
            EntityKind::TerritoryAddress => Some("territory"),
            EntityKind::House => Some("territory_address"),
            EntityKind::Visit => Some("house"),
            EntityKind::PhoneNumber => Some("territory"),
            EntityKind::PhoneCall => Some("phonenumber"),
            EntityKind::TokenTerritory | EntityKind::UserToken => Some("token"),
            _ => None,
        }
    }

    /// Distance from the root of this kind's hierarchy
    pub fn depth(self) -> usize {
        self.parent().map_or(0, |parent| parent.depth() + 1)
    }

    /// Kinds directly referencing this one
    pub fn children(self) -> Vec<EntityKind> {
        EntityKind::ALL
            .into_iter()
            .filter(|kind| kind.parent() == Some(self))
            .collect()
    }

    /// All kinds removed transitively when a row of this kind is deleted
    pub fn descendants(self) -> Vec<EntityKind> {
        let mut out = Vec::new();
        for child in self.children() {
            out.push(child);
            out.extend(child.descendants());
        }
        out
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EntityKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| format!("unknown entity kind '{}'", s))
    }
}

/// Identity of a row within its kind
///
/// Composite keys are kept as an explicit pair so that no separator
/// character can make two different pairs collide.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RecordKey {
    Id(String),
    Pair(String, String),
}

impl RecordKey {
    pub fn id(id: impl Into<String>) -> Self {
        RecordKey::Id(id.into())
    }

    pub fn pair(first: impl Into<String>, second: impl Into<String>) -> Self {
        RecordKey::Pair(first.into(), second.into())
    }

    /// Key components in primary-key column order
    pub fn parts(&self) -> Vec<&str> {
        match self {
            RecordKey::Id(id) => vec![id.as_str()],
            RecordKey::Pair(a, b) => vec![a.as_str(), b.as_str()],
        }
    }

    /// Whether this key has the right arity for `kind`
    pub fn fits(&self, kind: EntityKind) -> bool {
        matches!(
            (self, kind.is_composite()),
            (RecordKey::Id(_), false) | (RecordKey::Pair(..), true)
        )
    }

    /// Stable text form used in the pending-change log and request parameters
    ///
    /// Plain ids are stored as-is; pairs are stored as a JSON array.
    pub fn encode(&self) -> String {
        match self {
            RecordKey::Id(id) => id.clone(),
            RecordKey::Pair(..) => serde_json::to_string(self).unwrap_or_default(),
        }
    }

    /// Parse the text form produced by [`RecordKey::encode`] for `kind`
    pub fn decode(kind: EntityKind, encoded: &str) -> Option<Self> {
        if kind.is_composite() {
            let (a, b): (String, String) = serde_json::from_str(encoded).ok()?;
            Some(RecordKey::Pair(a, b))
        } else {
            Some(RecordKey::Id(encoded.to_string()))
        }
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordKey::Id(id) => f.write_str(id),
            RecordKey::Pair(a, b) => write!(f, "({}, {})", a, b),
        }
    }
}

/// Logical identity of a recall: one reminder per user and house
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecallKey {
    pub user: String,
    pub house: String,
}

impl From<RecallKey> for RecordKey {
    fn from(key: RecallKey) -> Self {
        RecordKey::Pair(key.user, key.house)
    }
}

/// Identity of a token grant on a territory
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TokenTerritoryKey {
    pub token: String,
    pub territory: String,
}

impl From<TokenTerritoryKey> for RecordKey {
    fn from(key: TokenTerritoryKey) -> Self {
        RecordKey::Pair(key.token, key.territory)
    }
}

/// Identity of a user's membership on a token
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UserTokenKey {
    pub token: String,
    pub user_id: String,
}

impl From<UserTokenKey> for RecordKey {
    fn from(key: UserTokenKey) -> Self {
        RecordKey::Pair(key.token, key.user_id)
    }
}

/// Build the id of a client-created row from its parent and a millisecond timestamp
///
/// Two devices creating records offline under different parents, or at
/// different instants, never produce the same id.
pub fn client_id(parent: &str, timestamp_ms: i64) -> String {
    format!("{}-{}", parent, timestamp_ms)
}

/// A service territory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Territory {
    pub id: String,
    pub congregation: String,
    pub number: i64,
    pub description: String,
    #[serde(default)]
    pub image: Option<String>,
}

/// A building or street address inside a territory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerritoryAddress {
    pub id: String,
    pub territory: String,
    pub address: String,
    #[serde(default)]
    pub floors: Option<i64>,
}

/// A single door at an address
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct House {
    pub id: String,
    pub territory_address: String,
    pub number: String,
    #[serde(default)]
    pub floor: Option<String>,
}

/// Outcome of calling at a house
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Visit {
    pub id: String,
    pub house: String,
    /// Milliseconds since the Unix epoch
    pub date: i64,
    pub symbol: String,
    pub notes: String,
    pub user: String,
}

impl Visit {
    pub fn client_id(house: &str, date: i64) -> String {
        client_id(house, date)
    }

    /// Create a visit with an id derived from its house and date
    pub fn new(
        house: impl Into<String>,
        date: i64,
        symbol: VisitSymbol,
        notes: impl Into<String>,
        user: impl Into<String>,
    ) -> Self {
        let house = house.into();
        Self {
            id: Self::client_id(&house, date),
            house,
            date,
            symbol: symbol.as_str().to_string(),
            notes: notes.into(),
            user: user.into(),
        }
    }
}

/// Symbols recorded for a visit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VisitSymbol {
    /// Not at home
    NC,
    /// No trespassing
    NT,
    /// Other
    O,
    /// Hostile
    H,
    /// Mail
    M,
}

impl VisitSymbol {
    pub fn as_str(self) -> &'static str {
        match self {
            VisitSymbol::NC => "NC",
            VisitSymbol::NT => "NT",
            VisitSymbol::O => "O",
            VisitSymbol::H => "H",
            VisitSymbol::M => "M",
        }
    }
}

impl FromStr for VisitSymbol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "NC" => Ok(VisitSymbol::NC),
            "NT" => Ok(VisitSymbol::NT),
            "O" => Ok(VisitSymbol::O),
            "H" => Ok(VisitSymbol::H),
            "M" => Ok(VisitSymbol::M),
            other => Err(format!("unknown visit symbol '{}'", other)),
        }
    }
}

/// An access grant shared with other publishers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Token {
    pub id: String,
    pub name: String,
    pub owner: String,
    pub congregation: String,
    pub moderator: bool,
    #[serde(default)]
    pub expire: Option<i64>,
    #[serde(default)]
    pub user: Option<String>,
}

/// Grants a token's holders access to one territory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenTerritory {
    pub token: String,
    pub territory: String,
}

impl TokenTerritory {
    pub fn grant_key(&self) -> TokenTerritoryKey {
        TokenTerritoryKey {
            token: self.token.clone(),
            territory: self.territory.clone(),
        }
    }
}

/// A user registered on a token
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserToken {
    pub token: String,
    #[serde(rename = "userId")]
    pub user_id: String,
    pub name: String,
    pub blocked: bool,
}

impl UserToken {
    pub fn member_key(&self) -> UserTokenKey {
        UserTokenKey {
            token: self.token.clone(),
            user_id: self.user_id.clone(),
        }
    }
}

/// Territory worked by telephone
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhoneTerritory {
    pub id: String,
    pub congregation: String,
    pub number: i64,
    pub description: String,
    #[serde(default)]
    pub image: Option<String>,
}

/// A number to call inside a phone territory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhoneNumber {
    pub id: String,
    pub congregation: String,
    pub number: String,
    pub territory: String,
    #[serde(default)]
    pub house: Option<String>,
}

/// Outcome of calling a phone number
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhoneCall {
    pub id: String,
    #[serde(rename = "phonenumber")]
    pub phone_number: String,
    /// Milliseconds since the Unix epoch
    pub date: i64,
    pub notes: String,
    pub user: String,
}

impl PhoneCall {
    pub fn client_id(phone_number: &str, date: i64) -> String {
        client_id(phone_number, date)
    }

    /// Create a call with an id derived from its number and date
    pub fn new(
        phone_number: impl Into<String>,
        date: i64,
        notes: impl Into<String>,
        user: impl Into<String>,
    ) -> Self {
        let phone_number = phone_number.into();
        Self {
            id: Self::client_id(&phone_number, date),
            phone_number,
            date,
            notes: notes.into(),
            user: user.into(),
        }
    }
}

/// A reminder to call back at a house
///
/// `id` is the server's surrogate and is never used for identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recall {
    #[serde(default)]
    pub id: i64,
    pub user: String,
    pub house: String,
}

impl Recall {
    pub fn recall_key(&self) -> RecallKey {
        RecallKey {
            user: self.user.clone(),
            house: self.house.clone(),
        }
    }
}

/// One record of any kind
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum AnyRecord {
    Territory(Territory),
    TerritoryAddress(TerritoryAddress),
    House(House),
    Visit(Visit),
    PhoneTerritory(PhoneTerritory),
    PhoneNumber(PhoneNumber),
    PhoneCall(PhoneCall),
    Token(Token),
    TokenTerritory(TokenTerritory),
    UserToken(UserToken),
    Recall(Recall),
}

impl AnyRecord {
    pub fn kind(&self) -> EntityKind {
        match self {
            AnyRecord::Territory(_) => EntityKind::Territory,
            AnyRecord::TerritoryAddress(_) => EntityKind::TerritoryAddress,
            AnyRecord::House(_) => EntityKind::House,
            AnyRecord::Visit(_) => EntityKind::Visit,
            AnyRecord::PhoneTerritory(_) => EntityKind::PhoneTerritory,
            AnyRecord::PhoneNumber(_) => EntityKind::PhoneNumber,
            AnyRecord::PhoneCall(_) => EntityKind::PhoneCall,
            AnyRecord::Token(_) => EntityKind::Token,
            AnyRecord::TokenTerritory(_) => EntityKind::TokenTerritory,
            AnyRecord::UserToken(_) => EntityKind::UserToken,
            AnyRecord::Recall(_) => EntityKind::Recall,
        }
    }

    /// Decode a wire payload of the given kind
    pub fn from_json(kind: EntityKind, value: serde_json::Value) -> serde_json::Result<Self> {
        Ok(match kind {
            EntityKind::Territory => AnyRecord::Territory(serde_json::from_value(value)?),
            EntityKind::TerritoryAddress => {
                AnyRecord::TerritoryAddress(serde_json::from_value(value)?)
            }
            EntityKind::House => AnyRecord::House(serde_json::from_value(value)?),
            EntityKind::Visit => AnyRecord::Visit(serde_json::from_value(value)?),
            EntityKind::PhoneTerritory => AnyRecord::PhoneTerritory(serde_json::from_value(value)?),
            EntityKind::PhoneNumber => AnyRecord::PhoneNumber(serde_json::from_value(value)?),
            EntityKind::PhoneCall => AnyRecord::PhoneCall(serde_json::from_value(value)?),
            EntityKind::Token => AnyRecord::Token(serde_json::from_value(value)?),
            EntityKind::TokenTerritory => AnyRecord::TokenTerritory(serde_json::from_value(value)?),
            EntityKind::UserToken => AnyRecord::UserToken(serde_json::from_value(value)?),
            EntityKind::Recall => AnyRecord::Recall(serde_json::from_value(value)?),
        })
    }

    pub fn to_json(&self) -> serde_json::Result<serde_json::Value> {
        serde_json::to_value(self)
    }
}

macro_rules! impl_from_record {
    ($($variant:ident),* $(,)?) => {
        $(
            impl From<$variant> for AnyRecord {
                fn from(record: $variant) -> Self {
                    AnyRecord::$variant(record)
                }
            }
        )*
    };
}

impl_from_record!(
    Territory,
    TerritoryAddress,
    House,
    Visit,
    PhoneTerritory,
    PhoneNumber,
    PhoneCall,
    Token,
    TokenTerritory,
    UserToken,
    Recall,
);
