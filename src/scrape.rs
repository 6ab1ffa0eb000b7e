use anyhow::anyhow;
use tracing::info;

use crate::error::ApiError;
use crate::extract::{extract, ExtractOptions};
use crate::lot::LotQuery;
use crate::types::ExtractionResult;
use crate::AppState;

/// Fetches and extracts the certificate for one validated lot.
///
/// A page that comes back without test rows (the vendor answers GET with its
/// search form, for instance) hands over to the next strategy in the chain.
/// If no later strategy yields rows either, the result is `NoTestData`.
pub async fn scrape_lot(state: &AppState, lot: &LotQuery) -> Result<ExtractionResult, ApiError> {
    info!("Scraping certificate for lot {}", lot);

    let _permit = state
        .outbound_limit
        .acquire()
        .await
        .map_err(|e| anyhow!("Outbound limiter closed: {}", e))?;

    let options = ExtractOptions {
        allow_fallback_data: state.config.enable_fallback_data,
    };
    let mut start = 0;

    while start < state.fetcher.len() {
        let (index, document) = match state.fetcher.fetch_from(start, lot).await {
            Ok(found) => found,
            Err(err) if start == 0 => return Err(err.into()),
            // an earlier strategy already answered with a page, just an empty one
            Err(_) => break,
        };

        let result = extract(&document.html, lot.as_str(), &options);
        if !result.tests.is_empty() {
            info!(
                "Lot {}: {} rows via '{}' (source: {:?}, degraded: {})",
                lot, result.count, document.strategy, result.source, result.degraded
            );
            return Ok(result);
        }

        info!("No test rows in page from '{}' for lot {}", document.strategy, lot);
        start = index + 1;
    }

    Err(ApiError::NoTestData {
        lot: lot.to_string(),
    })
}
