//! Registration queries and user edits.

use std::collections::HashMap;

use axum::{
    extract::{Path, Query, State},
    routing::{get, post},
    Json, Router,
};
use galleryd_common::{DiscoverySource, Error, Rating, Result};
use galleryd_db::{ImageRecord, MetadataPredicate, RecordFilter, RecordSort};
use serde::{Deserialize, Serialize};

use super::{AppContext, AppError};
use crate::hooks::HookDescription;
use crate::store::RecordPage;
use crate::thumbnails::CacheStats;

const DEFAULT_LIMIT: u32 = 50;
const MAX_LIMIT: u32 = 500;
const META_PREFIX: &str = "meta.";

pub fn image_routes() -> Router<AppContext> {
    Router::new()
        .route("/images", get(list_images))
        .route("/images/*filename", get(get_image))
        .route("/rating", post(set_rating))
        .route("/flag", post(set_flag))
        .route("/stats", get(stats))
        .route("/hooks", get(hooks))
}

/// Listing parameters parsed from the raw query map.
#[derive(Debug, PartialEq)]
pub struct ListQuery {
    pub filter: RecordFilter,
    pub sort: RecordSort,
    pub offset: u32,
    pub limit: u32,
}

impl ListQuery {
    /// `meta.<key>=<value>` matches a JSON value (falling back to a plain
    /// string); an empty value only requires the key to exist.
    pub fn parse(params: &HashMap<String, String>) -> Result<Self> {
        let mut query = ListQuery {
            filter: RecordFilter::default(),
            sort: RecordSort::default(),
            offset: 0,
            limit: DEFAULT_LIMIT,
        };

        let mut keys: Vec<&String> = params.keys().collect();
        keys.sort();
        for key in keys {
            let value = params[key].as_str();
            match key.as_str() {
                "offset" => query.offset = parse_number(key, value)?,
                "limit" => query.limit = parse_number::<u32>(key, value)?.clamp(1, MAX_LIMIT),
                "sort" => {
                    query.sort = serde_json::from_value(serde_json::Value::String(value.to_string()))
                        .map_err(|_| Error::invalid_input(format!("unknown sort: {value}")))?
                }
                "rating" => query.filter.rating = Some(Rating::try_from(parse_number::<i8>(key, value)?)?),
                "flagged" => query.filter.flagged = Some(parse_number(key, value)?),
                "source" => query.filter.source = Some(value.parse::<DiscoverySource>()?),
                "job_id" => query.filter.job_id = Some(value.to_string()),
                "include_pending_removal" => {
                    query.filter.include_pending_removal = parse_number(key, value)?
                }
                other => {
                    let Some(meta_key) = other.strip_prefix(META_PREFIX).filter(|k| !k.is_empty()) else {
                        return Err(Error::invalid_input(format!("unknown query parameter: {other}")));
                    };
                    let predicate = if value.is_empty() {
                        MetadataPredicate::Exists { key: meta_key.to_string() }
                    } else {
                        MetadataPredicate::Equals {
                            key: meta_key.to_string(),
                            value: serde_json::from_str(value)
                                .unwrap_or_else(|_| serde_json::Value::String(value.to_string())),
                        }
                    };
                    query.filter.metadata.push(predicate);
                }
            }
        }
        Ok(query)
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| Error::invalid_input(format!("invalid {key}: {value}")))
}

async fn list_images(
    State(ctx): State<AppContext>,
    Query(params): Query<HashMap<String, String>>,
) -> std::result::Result<Json<RecordPage>, AppError> {
    let query = ListQuery::parse(&params)?;
    let page = ctx
        .store
        .list(&query.filter, query.sort, query.offset, query.limit)?;
    Ok(Json(page))
}

async fn get_image(
    State(ctx): State<AppContext>,
    Path(filename): Path<String>,
) -> std::result::Result<Json<ImageRecord>, AppError> {
    Ok(Json(ctx.store.require(&filename)?))
}

#[derive(Debug, Deserialize)]
pub struct RatingRequest {
    pub filename: String,
    pub rating: i64,
}

async fn set_rating(
    State(ctx): State<AppContext>,
    Json(req): Json<RatingRequest>,
) -> std::result::Result<Json<ImageRecord>, AppError> {
    let rating = i8::try_from(req.rating)
        .map_err(|_| Error::invalid_input(format!("rating must be -1, 0 or 1 (got {})", req.rating)))
        .and_then(Rating::try_from)?;
    let record = ctx.store.set_rating(&req.filename, rating)?;
    tracing::info!(filename = %record.filename, rating = %rating, "Rating updated");
    Ok(Json(record))
}

#[derive(Debug, Deserialize)]
pub struct FlagRequest {
    pub filename: String,
    /// Omitted means toggle
    #[serde(default)]
    pub flagged: Option<bool>,
}

async fn set_flag(
    State(ctx): State<AppContext>,
    Json(req): Json<FlagRequest>,
) -> std::result::Result<Json<ImageRecord>, AppError> {
    let record = match req.flagged {
        Some(flagged) => ctx.store.set_flag(&req.filename, flagged)?,
        None => ctx.store.toggle_flag(&req.filename)?,
    };
    tracing::info!(filename = %record.filename, flagged = record.flagged, "Flag updated");
    Ok(Json(record))
}

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub registrations: galleryd_db::RegistrationStats,
    pub thumbnails: CacheStats,
    pub version: u64,
    pub subscribers: usize,
}

async fn stats(State(ctx): State<AppContext>) -> std::result::Result<Json<StatsResponse>, AppError> {
    Ok(Json(StatsResponse {
        registrations: ctx.store.stats()?,
        thumbnails: ctx.thumbnails.stats().await,
        version: ctx.broadcaster.version(),
        subscribers: ctx.broadcaster.session_count(),
    }))
}

async fn hooks(State(ctx): State<AppContext>) -> Json<Vec<HookDescription>> {
    Json(ctx.hooks.describe())
}
