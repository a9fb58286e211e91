use nutrisync_core::{AnalysisRecord, BackendClient, BackendError, NutritionReport, SaveReceipt};
use tracing::{debug, warn};

const DEVICE_INFO: &str = "nutrisyncd background service";

/// Saves one analysis result to the backend. `retry_attempt` tags the record
/// so retried deliveries can be told apart server-side.
pub async fn deliver(
    backend: &BackendClient,
    user_id: &str,
    image_path: &str,
    report: &NutritionReport,
    timestamp: i64,
    retry_attempt: Option<u32>,
) -> Result<SaveReceipt, BackendError> {
    let device_info = device_info(retry_attempt);
    let record = AnalysisRecord {
        user_id,
        image_path,
        analysis_result: report,
        timestamp,
        device_info: &device_info,
    };
    match backend.save_analysis(&record).await {
        Ok(receipt) => {
            debug!(
                user_id,
                image_path,
                record_id = ?receipt.id,
                attempt = ?retry_attempt,
                "analysis saved"
            );
            Ok(receipt)
        }
        Err(err) => {
            warn!(user_id, image_path, attempt = ?retry_attempt, %err, "analysis save failed");
            Err(err)
        }
    }
}

fn device_info(retry_attempt: Option<u32>) -> String {
    match retry_attempt {
        Some(attempt) => format!("{DEVICE_INFO} (retry {attempt})"),
        None => DEVICE_INFO.to_string(),
    }
}
