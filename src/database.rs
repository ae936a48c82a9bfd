use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use tracing::{debug, info};

use crate::camera_directory::{CameraDirectory, CameraTarget};
use crate::errors::Result;

// Table name constants for easy configuration
const TABLE_CAMERA: &str = "camera";
const TABLE_IMAGE: &str = "image";
const TABLE_ANALYSIS_RESULT: &str = "analysis_result";

const DEFAULT_ALERT_LIMIT: i64 = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CameraStatus {
    Active,
    #[default]
    Inactive,
    Maintenance,
    Error,
}

impl CameraStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CameraStatus::Active => "active",
            CameraStatus::Inactive => "inactive",
            CameraStatus::Maintenance => "maintenance",
            CameraStatus::Error => "error",
        }
    }
}

impl From<String> for CameraStatus {
    fn from(s: String) -> Self {
        match s.as_str() {
            "active" => CameraStatus::Active,
            "maintenance" => CameraStatus::Maintenance,
            "error" => CameraStatus::Error,
            _ => CameraStatus::Inactive,
        }
    }
}

/// Outcome of one analysis, from `nothing` up to `high` severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    #[default]
    Nothing,
    Low,
    Medium,
    High,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Nothing => "nothing",
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
        }
    }
}

impl From<String> for Severity {
    fn from(s: String) -> Self {
        match s.as_str() {
            "low" => Severity::Low,
            "medium" => Severity::Medium,
            "high" => Severity::High,
            _ => Severity::Nothing,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Camera {
    pub id: i64,
    pub name: Option<String>,
    pub location: Option<String>,
    pub status: CameraStatus,
    pub ip_address: String,
    pub model: Option<String>,
    pub username: String,
    #[serde(skip_serializing)]
    pub password: String,
    pub last_connection: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields accepted when creating or replacing a camera
#[derive(Debug, Clone, Deserialize)]
pub struct CameraInput {
    pub name: Option<String>,
    pub location: Option<String>,
    #[serde(default)]
    pub status: CameraStatus,
    pub ip_address: String,
    pub model: Option<String>,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Alert {
    pub id: i64,
    pub image_id: i64,
    pub camera_id: Option<i64>,
    pub uri: String,
    pub result: Severity,
    pub confidence: Option<f64>,
    pub human_verification: bool,
    pub is_resolved: bool,
    pub date: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewAlert {
    pub camera_id: Option<i64>,
    pub uri: String,
    pub result: Severity,
    pub confidence: Option<f64>,
    pub date: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait DatabaseProvider: Send + Sync {
    async fn initialize(&self) -> Result<()>;

    async fn list_cameras(&self) -> Result<Vec<Camera>>;

    async fn get_camera(&self, id: i64) -> Result<Option<Camera>>;

    async fn create_camera(&self, camera: &CameraInput) -> Result<i64>;

    /// Returns false if no camera has this id
    async fn update_camera(&self, id: i64, camera: &CameraInput) -> Result<bool>;

    async fn delete_camera(&self, id: i64) -> Result<bool>;

    /// Newest first
    async fn list_alerts(&self, limit: Option<i64>) -> Result<Vec<Alert>>;

    async fn create_alert(&self, alert: &NewAlert) -> Result<i64>;

    async fn verify_alert(&self, id: i64, human_verification: bool, is_resolved: bool) -> Result<bool>;
}

pub struct SqliteDatabase {
    pool: SqlitePool,
}

impl SqliteDatabase {
    pub async fn new(database_path: &str, max_connections: u32) -> Result<Self> {
        let pool = if database_path == ":memory:" {
            // Every connection to :memory: is a separate database.
            SqlitePoolOptions::new()
                .max_connections(1)
                .connect("sqlite::memory:")
                .await?
        } else {
            // Ensure the directory exists
            if let Some(parent) = std::path::Path::new(database_path).parent() {
                std::fs::create_dir_all(parent)?;
            }
            let database_url = format!("sqlite://{}?mode=rwc", database_path);
            SqlitePoolOptions::new()
                .max_connections(max_connections.max(1))
                .connect(&database_url)
                .await?
        };

        info!("Opened database at {}", database_path);
        Ok(Self { pool })
    }
}

fn camera_from_row(row: &SqliteRow) -> Result<Camera> {
    Ok(Camera {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        location: row.try_get("location")?,
        status: CameraStatus::from(row.try_get::<String, _>("status")?),
        ip_address: row.try_get("ip_address")?,
        model: row.try_get("model")?,
        username: row.try_get("username")?,
        password: row.try_get("password")?,
        last_connection: row.try_get("last_connection")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn alert_from_row(row: &SqliteRow) -> Result<Alert> {
    Ok(Alert {
        id: row.try_get("id")?,
        image_id: row.try_get("fk_image")?,
        camera_id: row.try_get("fk_camera")?,
        uri: row.try_get("uri")?,
        result: Severity::from(row.try_get::<String, _>("result")?),
        confidence: row.try_get("confidence")?,
        human_verification: row.try_get("human_verification")?,
        is_resolved: row.try_get("is_resolved")?,
        date: row.try_get("date")?,
    })
}

#[async_trait]
impl DatabaseProvider for SqliteDatabase {
    async fn initialize(&self) -> Result<()> {
        let create_camera_query = format!(
            r#"
            CREATE TABLE IF NOT EXISTS {} (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT,
                location TEXT,
                status TEXT NOT NULL DEFAULT 'inactive',
                ip_address TEXT NOT NULL,
                model TEXT,
                username TEXT NOT NULL DEFAULT '',
                password TEXT NOT NULL DEFAULT '',
                last_connection TIMESTAMP,
                created_at TIMESTAMP NOT NULL,
                updated_at TIMESTAMP NOT NULL
            )
            "#,
            TABLE_CAMERA
        );
        sqlx::query(&create_camera_query)
            .execute(&self.pool)
            .await?;

        let create_image_query = format!(
            r#"
            CREATE TABLE IF NOT EXISTS {} (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                date TIMESTAMP NOT NULL,
                uri TEXT NOT NULL,
                fk_camera INTEGER,
                FOREIGN KEY (fk_camera) REFERENCES {}(id) ON DELETE CASCADE
            )
            "#,
            TABLE_IMAGE, TABLE_CAMERA
        );
        sqlx::query(&create_image_query)
            .execute(&self.pool)
            .await?;

        let create_result_query = format!(
            r#"
            CREATE TABLE IF NOT EXISTS {} (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                fk_image INTEGER NOT NULL,
                result TEXT NOT NULL DEFAULT 'nothing',
                confidence REAL,
                date TIMESTAMP NOT NULL,
                human_verification BOOLEAN NOT NULL DEFAULT 0,
                is_resolved BOOLEAN NOT NULL DEFAULT 0,
                created_at TIMESTAMP NOT NULL,
                updated_at TIMESTAMP NOT NULL,
                FOREIGN KEY (fk_image) REFERENCES {}(id) ON DELETE CASCADE
            )
            "#,
            TABLE_ANALYSIS_RESULT, TABLE_IMAGE
        );
        sqlx::query(&create_result_query)
            .execute(&self.pool)
            .await?;

        let indexes = [
            format!("CREATE INDEX IF NOT EXISTS idx_image_date ON {}(date)", TABLE_IMAGE),
            format!("CREATE INDEX IF NOT EXISTS idx_image_camera ON {}(fk_camera)", TABLE_IMAGE),
            format!("CREATE INDEX IF NOT EXISTS idx_result_image ON {}(fk_image)", TABLE_ANALYSIS_RESULT),
            format!("CREATE INDEX IF NOT EXISTS idx_result_date ON {}(date)", TABLE_ANALYSIS_RESULT),
        ];
        for index in indexes {
            sqlx::query(&index).execute(&self.pool).await?;
        }

        debug!("Database schema initialized");
        Ok(())
    }

    async fn list_cameras(&self) -> Result<Vec<Camera>> {
        let query = format!("SELECT * FROM {} ORDER BY id", TABLE_CAMERA);
        let rows = sqlx::query(&query).fetch_all(&self.pool).await?;
        rows.iter().map(camera_from_row).collect()
    }

    async fn get_camera(&self, id: i64) -> Result<Option<Camera>> {
        let query = format!("SELECT * FROM {} WHERE id = ?", TABLE_CAMERA);
        let row = sqlx::query(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(camera_from_row).transpose()
    }

    async fn create_camera(&self, camera: &CameraInput) -> Result<i64> {
        let now = Utc::now();
        let query = format!(
            "INSERT INTO {} (name, location, status, ip_address, model, username, password, last_connection, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            TABLE_CAMERA
        );
        let result = sqlx::query(&query)
            .bind(&camera.name)
            .bind(&camera.location)
            .bind(camera.status.as_str())
            .bind(&camera.ip_address)
            .bind(&camera.model)
            .bind(&camera.username)
            .bind(&camera.password)
            .bind(now)
            .bind(now)
            .bind(now)
            .execute(&self.pool)
            .await?;
        Ok(result.last_insert_rowid())
    }

    async fn update_camera(&self, id: i64, camera: &CameraInput) -> Result<bool> {
        let now = Utc::now();
        let query = format!(
            "UPDATE {} SET name = ?, location = ?, status = ?, ip_address = ?, model = ?, username = ?, password = ?,
             last_connection = ?, updated_at = ? WHERE id = ?",
            TABLE_CAMERA
        );
        let result = sqlx::query(&query)
            .bind(&camera.name)
            .bind(&camera.location)
            .bind(camera.status.as_str())
            .bind(&camera.ip_address)
            .bind(&camera.model)
            .bind(&camera.username)
            .bind(&camera.password)
            .bind(now)
            .bind(now)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_camera(&self, id: i64) -> Result<bool> {
        let query = format!("DELETE FROM {} WHERE id = ?", TABLE_CAMERA);
        let result = sqlx::query(&query)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_alerts(&self, limit: Option<i64>) -> Result<Vec<Alert>> {
        let query = format!(
            "SELECT r.id, r.fk_image, r.result, r.confidence, r.human_verification, r.is_resolved, r.date,
                    i.uri, i.fk_camera
             FROM {} r JOIN {} i ON r.fk_image = i.id
             ORDER BY r.date DESC, r.id DESC
             LIMIT ?",
            TABLE_ANALYSIS_RESULT, TABLE_IMAGE
        );
        let limit = limit.unwrap_or(DEFAULT_ALERT_LIMIT).clamp(1, 1000);
        let rows = sqlx::query(&query)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(alert_from_row).collect()
    }

    async fn create_alert(&self, alert: &NewAlert) -> Result<i64> {
        let now = Utc::now();
        let date = alert.date.unwrap_or(now);
        let mut tx = self.pool.begin().await?;

        let image_query = format!("INSERT INTO {} (date, uri, fk_camera) VALUES (?, ?, ?)", TABLE_IMAGE);
        let image_id = sqlx::query(&image_query)
            .bind(date)
            .bind(&alert.uri)
            .bind(alert.camera_id)
            .execute(&mut *tx)
            .await?
            .last_insert_rowid();

        let result_query = format!(
            "INSERT INTO {} (fk_image, result, confidence, date, created_at, updated_at) VALUES (?, ?, ?, ?, ?, ?)",
            TABLE_ANALYSIS_RESULT
        );
        let alert_id = sqlx::query(&result_query)
            .bind(image_id)
            .bind(alert.result.as_str())
            .bind(alert.confidence)
            .bind(date)
            .bind(now)
            .bind(now)
            .execute(&mut *tx)
            .await?
            .last_insert_rowid();

        tx.commit().await?;
        Ok(alert_id)
    }

    async fn verify_alert(&self, id: i64, human_verification: bool, is_resolved: bool) -> Result<bool> {
        let query = format!(
            "UPDATE {} SET human_verification = ?, is_resolved = ?, updated_at = ? WHERE id = ?",
            TABLE_ANALYSIS_RESULT
        );
        let result = sqlx::query(&query)
            .bind(human_verification)
            .bind(is_resolved)
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl CameraDirectory for SqliteDatabase {
    async fn resolve(&self, camera_id: &str) -> Result<Option<CameraTarget>> {
        let Ok(id) = camera_id.trim().parse::<i64>() else {
            return Ok(None);
        };
        Ok(self.get_camera(id).await?.map(|camera| CameraTarget {
            id: camera.id.to_string(),
            address: camera.ip_address,
            username: camera.username,
            password: camera.password,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn database() -> SqliteDatabase {
        let db = SqliteDatabase::new(":memory:", 1).await.unwrap();
        db.initialize().await.unwrap();
        db
    }

    fn camera(ip: &str) -> CameraInput {
        CameraInput {
            name: Some("Entrance".to_string()),
            location: Some("Hall A".to_string()),
            status: CameraStatus::Active,
            ip_address: ip.to_string(),
            model: Some("Eufy".to_string()),
            username: "admin".to_string(),
            password: "secret".to_string(),
        }
    }

    #[tokio::test]
    async fn camera_crud() {
        let db = database().await;
        let id = db.create_camera(&camera("10.0.0.1")).await.unwrap();

        let stored = db.get_camera(id).await.unwrap().unwrap();
        assert_eq!(stored.ip_address, "10.0.0.1");
        assert_eq!(stored.status, CameraStatus::Active);
        assert!(stored.last_connection.is_some());

        let mut changed = camera("10.0.0.2");
        changed.status = CameraStatus::Maintenance;
        assert!(db.update_camera(id, &changed).await.unwrap());
        assert!(!db.update_camera(id + 100, &changed).await.unwrap());
        let stored = db.get_camera(id).await.unwrap().unwrap();
        assert_eq!(stored.ip_address, "10.0.0.2");
        assert_eq!(stored.status, CameraStatus::Maintenance);

        assert_eq!(db.list_cameras().await.unwrap().len(), 1);
        assert!(db.delete_camera(id).await.unwrap());
        assert!(!db.delete_camera(id).await.unwrap());
        assert!(db.get_camera(id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn resolves_camera_targets() {
        let db = database().await;
        let id = db.create_camera(&camera("192.168.0.9")).await.unwrap();

        let target = db.resolve(&id.to_string()).await.unwrap().unwrap();
        assert_eq!(target.address, "192.168.0.9");
        assert_eq!(target.username, "admin");
        assert_eq!(target.password, "secret");

        assert!(db.resolve("9999").await.unwrap().is_none());
        assert!(db.resolve("not-a-number").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn alerts_are_listed_newest_first_and_can_be_verified() {
        let db = database().await;
        let cam = db.create_camera(&camera("10.0.0.3")).await.unwrap();
        let older = Utc::now() - chrono::Duration::minutes(5);

        let first = db.create_alert(&NewAlert {
            camera_id: Some(cam),
            uri: "/img/1.jpg".to_string(),
            result: Severity::Low,
            confidence: Some(0.42),
            date: Some(older),
        }).await.unwrap();
        let second = db.create_alert(&NewAlert {
            camera_id: Some(cam),
            uri: "/img/2.jpg".to_string(),
            result: Severity::High,
            confidence: None,
            date: None,
        }).await.unwrap();

        let alerts = db.list_alerts(None).await.unwrap();
        assert_eq!(alerts.iter().map(|a| a.id).collect::<Vec<_>>(), vec![second, first]);
        assert_eq!(alerts[0].result, Severity::High);
        assert_eq!(alerts[1].uri, "/img/1.jpg");
        assert_eq!(alerts[1].camera_id, Some(cam));
        assert!(!alerts[0].human_verification);

        assert!(db.verify_alert(first, true, true).await.unwrap());
        assert!(!db.verify_alert(first + 100, true, false).await.unwrap());
        let alerts = db.list_alerts(Some(1)).await.unwrap();
        assert_eq!(alerts.len(), 1);
        let verified = db.list_alerts(None).await.unwrap().into_iter().find(|a| a.id == first).unwrap();
        assert!(verified.human_verification);
        assert!(verified.is_resolved);
    }

    #[tokio::test]
    async fn deleting_a_camera_cascades_to_its_alerts() {
        let db = database().await;
        let cam = db.create_camera(&camera("10.0.0.4")).await.unwrap();
        db.create_alert(&NewAlert {
            camera_id: Some(cam),
            uri: "/img/3.jpg".to_string(),
            result: Severity::Medium,
            confidence: Some(0.7),
            date: None,
        }).await.unwrap();

        assert!(db.delete_camera(cam).await.unwrap());
        assert!(db.list_alerts(None).await.unwrap().is_empty());
    }
}
