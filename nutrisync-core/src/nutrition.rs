use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum NutritionError {
    #[error("analysis payload has neither foods/total nor nutrition fields")]
    UnrecognizedShape,
    #[error("invalid analysis payload: {0}")]
    Invalid(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct NutritionFacts {
    #[serde(default)]
    pub calories: f64,
    #[serde(default)]
    pub protein: f64,
    #[serde(default)]
    pub carbs: f64,
    #[serde(default)]
    pub fat: f64,
    #[serde(default)]
    pub fiber: f64,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct FoodItem {
    pub name: String,
    #[serde(default)]
    pub portion: String,
    #[serde(default)]
    pub weight_g: f64,
    #[serde(default)]
    pub nutrition: NutritionFacts,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    High,
    #[default]
    Medium,
    Low,
    #[serde(other)]
    Unknown,
}

/// Structured result of one food image analysis.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct NutritionReport {
    pub foods: Vec<FoodItem>,
    pub total: NutritionFacts,
    #[serde(default)]
    pub confidence: Confidence,
}

impl NutritionReport {
    /// Parses the text returned by the vision model, tolerating markdown fences.
    pub fn from_model_text(text: &str) -> Result<Self, NutritionError> {
        let cleaned = strip_code_fences(text);
        let value: Value = serde_json::from_str(&cleaned)?;
        Self::from_value(value)
    }

    /// Accepts the canonical `{foods, total, confidence}` shape and the older
    /// manual-save shape `{nutrition, detailedItems, category, confidence}`.
    pub fn from_value(value: Value) -> Result<Self, NutritionError> {
        if value.get("foods").is_some() && value.get("total").is_some() {
            return Ok(serde_json::from_value(value)?);
        }
        if value.get("nutrition").is_some_and(Value::is_object) {
            let legacy: ManualSaveReport = serde_json::from_value(value)?;
            return Ok(legacy.into_report());
        }
        Err(NutritionError::UnrecognizedShape)
    }
}

#[derive(Debug, Deserialize)]
struct ManualSaveReport {
    nutrition: NutritionFacts,
    #[serde(default, rename = "detailedItems")]
    detailed_items: Vec<ManualSaveItem>,
    #[serde(default)]
    category: Option<ManualSaveCategory>,
    #[serde(default)]
    confidence: Option<Confidence>,
}

#[derive(Debug, Deserialize)]
struct ManualSaveItem {
    #[serde(default)]
    name: Option<String>,
    #[serde(default, rename = "portionDescription")]
    portion_description: Option<String>,
    #[serde(default, rename = "estimatedWeight")]
    estimated_weight: Option<Value>,
    #[serde(flatten)]
    facts: NutritionFacts,
}

#[derive(Debug, Deserialize)]
struct ManualSaveCategory {
    #[serde(default)]
    name: Option<String>,
}

const UNKNOWN_FOOD: &str = "Unknown Food";
const DEFAULT_PORTION: &str = "1 serving";
const DEFAULT_WEIGHT_G: f64 = 100.0;

impl ManualSaveReport {
    fn into_report(self) -> NutritionReport {
        let foods = if self.detailed_items.is_empty() {
            vec![FoodItem {
                name: self
                    .category
                    .and_then(|category| category.name)
                    .unwrap_or_else(|| UNKNOWN_FOOD.to_string()),
                portion: DEFAULT_PORTION.to_string(),
                weight_g: DEFAULT_WEIGHT_G,
                nutrition: self.nutrition.clone(),
            }]
        } else {
            self.detailed_items
                .into_iter()
                .map(|item| FoodItem {
                    name: item.name.unwrap_or_else(|| UNKNOWN_FOOD.to_string()),
                    portion: item
                        .portion_description
                        .unwrap_or_else(|| DEFAULT_PORTION.to_string()),
                    weight_g: item
                        .estimated_weight
                        .as_ref()
                        .and_then(Value::as_f64)
                        .unwrap_or(DEFAULT_WEIGHT_G),
                    nutrition: item.facts,
                })
                .collect()
        };
        NutritionReport {
            foods,
            total: self.nutrition,
            confidence: self.confidence.unwrap_or_default(),
        }
    }
}

/// Removes ```` ```json ```` / ```` ``` ```` markers the model sometimes wraps
/// its answer in.
pub fn strip_code_fences(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(idx) = rest.find("```") {
        out.push_str(&rest[..idx]);
        rest = &rest[idx + 3..];
        if rest.get(..4).is_some_and(|tag| tag.eq_ignore_ascii_case("json")) {
            rest = rest[4..].trim_start();
        }
    }
    out.push_str(rest);
    out.trim().to_string()
}
