use axum::{
    Extension, Json,
    extract::{Path, State},
};
use uuid::Uuid;

use theralink_db::StoreError;
use theralink_types::api::{Claims, UpsertProfileRequest};
use theralink_types::models::ProfileSummary;

use crate::error::ApiError;
use crate::{AppState, run_db};

/// Mirror the caller's display data from the identity provider.
pub async fn upsert_me(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<UpsertProfileRequest>,
) -> Result<Json<ProfileSummary>, ApiError> {
    let user_id = claims.sub;
    let profile = run_db(&state, move |db| {
        db.upsert_profile(user_id, &req.display_name, req.avatar_url.as_deref())
    })
    .await?;

    Ok(Json(profile))
}

pub async fn get_profile(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
    Extension(_claims): Extension<Claims>,
) -> Result<Json<ProfileSummary>, ApiError> {
    let profile = run_db(&state, move |db| db.get_profile(user_id))
        .await?
        .ok_or_else(|| StoreError::NotFound(format!("profile {}", user_id)))?;

    Ok(Json(profile))
}
