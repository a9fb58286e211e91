mod analysis;
mod backend;
mod nutrition;

pub use analysis::{ANALYSIS_PROMPT, AnalysisError, VisionClient, mime_type_for};
pub use backend::{AnalysisRecord, BackendClient, BackendError, SaveReceipt};
pub use nutrition::{
    Confidence, FoodItem, NutritionError, NutritionFacts, NutritionReport, strip_code_fences,
};
