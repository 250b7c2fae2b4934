//! Closet item data model.

use crate::error::{FieldError, ValidationErrors};
use crate::keys::ObjectKey;
use crate::upload::PhotoFile;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Identity-provider user id; scopes every record and storage path
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OwnerId(String);

impl OwnerId {
    /// Returns `None` for a blank id, which must never stand in for a user
    pub fn new(id: impl Into<String>) -> Option<Self> {
        let id = id.into();
        if id.trim().is_empty() {
            None
        } else {
            Some(Self(id))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Record id assigned by the data store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemId(pub Uuid);

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for ItemId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(ItemId)
    }
}

/// Fixed set of wardrobe categories
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Tops,
    Bottoms,
    Outerwear,
    Shoes,
    Accessories,
}

impl Category {
    pub const ALL: [Category; 5] = [
        Category::Tops,
        Category::Bottoms,
        Category::Outerwear,
        Category::Shoes,
        Category::Accessories,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Tops => "tops",
            Category::Bottoms => "bottoms",
            Category::Outerwear => "outerwear",
            Category::Shoes => "shoes",
            Category::Accessories => "accessories",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unknown category name
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown category `{0}`")]
pub struct UnknownCategory(pub String);

impl FromStr for Category {
    type Err = UnknownCategory;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim();
        Category::ALL
            .into_iter()
            .find(|c| c.as_str().eq_ignore_ascii_case(wanted))
            .ok_or_else(|| UnknownCategory(s.to_string()))
    }
}

/// Descriptive fields of an item, stored verbatim
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemDetails {
    pub brand: String,
    pub item_name: String,
    pub category: Category,
    pub size: String,
    pub color: String,
}

/// One wardrobe item owned by exactly one user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClosetItem {
    pub id: ItemId,
    pub owner_id: OwnerId,
    #[serde(flatten)]
    pub details: ItemDetails,
    /// Ordered as the photos were submitted
    pub photo_keys: Vec<ObjectKey>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Record payload handed to the data API on create
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewClosetItem {
    pub owner_id: OwnerId,
    pub details: ItemDetails,
    pub photo_keys: Vec<ObjectKey>,
}

/// List filter and pagination
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ItemQuery {
    pub category: Option<Category>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

/// Photo count bounds enforced before any upload starts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhotoLimits {
    pub min: usize,
    pub max: usize,
}

impl PhotoLimits {
    /// Bounds of the `closet_items` photo count constraint
    pub const STORED_MIN: usize = 2;
    pub const STORED_MAX: usize = 5;
}

impl Default for PhotoLimits {
    fn default() -> Self {
        Self {
            min: Self::STORED_MIN,
            max: Self::STORED_MAX,
        }
    }
}

/// Raw add-item form as submitted by the user
#[derive(Debug, Clone, Default)]
pub struct ItemForm {
    pub brand: String,
    pub item_name: String,
    pub category: String,
    pub size: String,
    pub color: String,
    pub photos: Vec<PhotoFile>,
}

/// Form that passed validation; only these reach the network
#[derive(Debug, Clone)]
pub struct ValidatedForm {
    pub details: ItemDetails,
    pub photos: Vec<PhotoFile>,
}

impl ItemForm {
    /// Check every field and the photo count, reporting all problems at once
    pub fn validate(self, limits: PhotoLimits) -> Result<ValidatedForm, ValidationErrors> {
        let mut errors = Vec::new();

        if self.photos.len() < limits.min {
            errors.push(FieldError::new(
                "photos",
                format!("Please add at least {} photos", limits.min),
            ));
        } else if self.photos.len() > limits.max {
            errors.push(FieldError::new(
                "photos",
                format!("Please add at most {} photos", limits.max),
            ));
        }

        let required = [
            ("brand", &self.brand),
            ("itemName", &self.item_name),
            ("size", &self.size),
            ("color", &self.color),
        ];
        for (field, value) in required {
            if value.trim().is_empty() {
                errors.push(FieldError::new(field, "is required"));
            }
        }

        let category = if self.category.trim().is_empty() {
            errors.push(FieldError::new("category", "is required"));
            None
        } else {
            match self.category.parse::<Category>() {
                Ok(category) => Some(category),
                Err(e) => {
                    errors.push(FieldError::new("category", e.to_string()));
                    None
                }
            }
        };

        match category {
            Some(category) if errors.is_empty() => Ok(ValidatedForm {
                details: ItemDetails {
                    brand: self.brand,
                    item_name: self.item_name,
                    category,
                    size: self.size,
                    color: self.color,
                },
                photos: self.photos,
            }),
            _ => Err(ValidationErrors::new(errors)),
        }
    }
}

/// Validate an edit to the descriptive fields
pub fn validate_details(details: &ItemDetails) -> Result<(), ValidationErrors> {
    let errors: Vec<_> = [
        ("brand", &details.brand),
        ("itemName", &details.item_name),
        ("size", &details.size),
        ("color", &details.color),
    ]
    .into_iter()
    .filter(|(_, value)| value.trim().is_empty())
    .map(|(field, _)| FieldError::new(field, "is required"))
    .collect();

    if errors.is_empty() {
        Ok(())
    } else {
        Err(ValidationErrors::new(errors))
    }
}
