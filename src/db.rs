use std::str::FromStr;

use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    SqlitePool,
};
use tracing::info;

use crate::{config::AppConfig, error::AppError, models::User};

pub async fn connect_from_config(cfg: &AppConfig) -> Result<SqlitePool> {
    connect(&cfg.database_url).await
}

pub async fn connect(database_url: &str) -> Result<SqlitePool> {
    info!("Conectando a la base de datos de usuarios en {database_url}...");
    let options = SqliteConnectOptions::from_str(database_url)
        .with_context(|| format!("DATABASE_URL inválida: {database_url}"))?
        .create_if_missing(true);

    // Una sola conexión mantiene viva la base en memoria de los tests.
    let max_connections = if database_url.contains(":memory:") { 1 } else { 5 };
    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect_with(options)
        .await
        .context("No se pudo abrir la base de datos de usuarios")?;
    info!("Conexión a la base de datos OK");
    Ok(pool)
}

/// Crea la tabla `users` si todavía no existe.
pub async fn ensure_schema(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS users (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            username TEXT NOT NULL UNIQUE,
            hashed_password TEXT NOT NULL,
            created_at TEXT NOT NULL
        )",
    )
    .execute(pool)
    .await
    .context("No se pudo crear la tabla users")?;

    info!("Esquema de usuarios asegurado.");
    Ok(())
}

pub async fn find_user_by_username(
    pool: &SqlitePool,
    username: &str,
) -> Result<Option<User>, AppError> {
    let user = sqlx::query_as::<_, User>(
        "SELECT id, username, hashed_password, created_at FROM users WHERE username = ?",
    )
    .bind(username)
    .fetch_optional(pool)
    .await?;
    Ok(user)
}

/// Inserta un usuario nuevo. La restricción UNIQUE resuelve la carrera entre
/// dos signups simultáneos con el mismo nombre.
pub async fn insert_user(
    pool: &SqlitePool,
    username: &str,
    hashed_password: &str,
) -> Result<User, AppError> {
    let created_at = Utc::now();
    let result = sqlx::query(
        "INSERT INTO users (username, hashed_password, created_at) VALUES (?, ?, ?)",
    )
    .bind(username)
    .bind(hashed_password)
    .bind(created_at)
    .execute(pool)
    .await;

    match result {
        Ok(done) => Ok(User {
            id: done.last_insert_rowid(),
            username: username.to_string(),
            hashed_password: hashed_password.to_string(),
            created_at,
        }),
        Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
            Err(AppError::UsernameTaken)
        }
        Err(e) => Err(AppError::Database(e)),
    }
}
