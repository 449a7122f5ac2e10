use async_graphql::dynamic::Schema as DynamicSchema;
use async_graphql::EmptySubscription;
use async_graphql_axum::{GraphQLRequest, GraphQLResponse};
use axum::{
    extract::State,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use sea_orm::DatabaseConnection;
use std::sync::Arc;

use crate::admin_mutations::{AdminMutation, AdminQuery};
use crate::entities;
use crate::errors::SakhiError;
use crate::jobs::JobContext;

pub type JobsSchema = async_graphql::Schema<AdminQuery, AdminMutation, EmptySubscription>;

/// Initialize the Seaography admin GraphQL schema with all entities
pub fn build_seaography_schema(db: DatabaseConnection) -> Result<DynamicSchema, SakhiError> {
    use seaography::{Builder, BuilderContext};

    // Seaography keeps a 'static reference to its context
    let context: &'static BuilderContext = Box::leak(Box::new(BuilderContext::default()));

    let mut builder = Builder::new(context, db.clone());

    builder.register_entity::<entities::user::Entity>(vec![]);
    builder.register_entity::<entities::farmer::Entity>(vec![]);
    builder.register_entity::<entities::farm::Entity>(vec![]);
    builder.register_entity::<entities::field::Entity>(vec![]);
    builder.register_entity::<entities::media::Entity>(vec![]);
    builder.register_entity::<entities::activity::Entity>(vec![]);
    builder.register_entity::<entities::advisory::Entity>(vec![]);
    builder.register_entity::<entities::reminder::Entity>(vec![]);
    builder.register_entity::<entities::notification::Entity>(vec![]);
    builder.register_entity::<entities::consent::Entity>(vec![]);
    builder.register_entity::<entities::audit_log::Entity>(vec![]);
    builder.register_entity::<entities::otp_challenge::Entity>(vec![]);
    builder.register_entity::<entities::otp_throttle::Entity>(vec![]);
    builder.register_entity::<entities::refresh_token::Entity>(vec![]);
    builder.register_entity::<entities::weather_obs::Entity>(vec![]);
    builder.register_entity::<entities::pest_report::Entity>(vec![]);
    builder.register_entity::<entities::price_point::Entity>(vec![]);
    builder.register_entity::<entities::kb_doc::Entity>(vec![]);
    builder.register_entity::<entities::kb_chunk::Entity>(vec![]);
    builder.register_entity::<entities::job_execution::Entity>(vec![]);

    builder
        .schema_builder()
        .finish()
        .map_err(|e| SakhiError::Other(format!("Failed to build admin schema: {}", e)))
}

/// Build custom job management GraphQL schema
pub fn build_jobs_schema(ctx: JobContext) -> JobsSchema {
    async_graphql::Schema::build(AdminQuery, AdminMutation, EmptySubscription)
        .data(ctx)
        .finish()
}

#[derive(Clone)]
pub struct SeaographyState {
    pub schema: DynamicSchema,
}

#[derive(Clone)]
pub struct JobsState {
    pub schema: JobsSchema,
}

/// Seaography GraphQL POST handler for entity CRUD
async fn seaography_handler(
    State(state): State<Arc<SeaographyState>>,
    req: GraphQLRequest,
) -> GraphQLResponse {
    state.schema.execute(req.into_inner()).await.into()
}

/// Jobs GraphQL POST handler for job management
async fn jobs_handler(
    State(state): State<Arc<JobsState>>,
    req: GraphQLRequest,
) -> GraphQLResponse {
    state.schema.execute(req.into_inner()).await.into()
}

async fn seaography_playground() -> impl IntoResponse {
    axum::response::Html(
        async_graphql::http::GraphiQLSource::build()
            .endpoint("/admin/graphql")
            .finish(),
    )
}

async fn jobs_playground() -> impl IntoResponse {
    axum::response::Html(
        async_graphql::http::GraphiQLSource::build()
            .endpoint("/admin/jobs")
            .finish(),
    )
}

/// Create the admin API router with both Seaography and custom job endpoints
pub fn router(seaography_schema: DynamicSchema, jobs_schema: JobsSchema) -> Router {
    let seaography_state = Arc::new(SeaographyState {
        schema: seaography_schema,
    });
    let jobs_state = Arc::new(JobsState {
        schema: jobs_schema,
    });

    Router::new()
        // Seaography entity CRUD
        .route("/admin/graphql", post(seaography_handler))
        .route("/admin/playground", get(seaography_playground))
        .with_state(seaography_state)
        // Custom job management
        .route("/admin/jobs", post(jobs_handler))
        .route("/admin/jobs/playground", get(jobs_playground))
        .with_state(jobs_state)
}
