use async_trait::async_trait;
use sqlx::{PgPool, Row};

use crate::error::NotifyError;
use crate::models::Settings;

/// Fixed key of the singleton settings row.
pub const SETTINGS_ID: i32 = 1;

/// Read-one / upsert-one access to the provider settings.
#[async_trait]
pub trait SettingsStore: Send + Sync {
    /// `None` means the console has not been configured yet.
    async fn load(&self) -> Result<Option<Settings>, NotifyError>;

    async fn upsert(&self, settings: &Settings) -> Result<(), NotifyError>;
}

#[derive(Clone)]
pub struct PgSettingsStore {
    pool: PgPool,
}

impl PgSettingsStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

pub async fn init_db(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

#[async_trait]
impl SettingsStore for PgSettingsStore {
    async fn load(&self) -> Result<Option<Settings>, NotifyError> {
        let row = sqlx::query(
            r#"
            SELECT phone_number_id, waba_id, access_token, endpoint,
                   fees_template_name, marks_template_name, lock_password
            FROM edualert.settings
            WHERE id = $1
            "#,
        )
        .bind(SETTINGS_ID)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| Settings {
            phone_number_id: row.get("phone_number_id"),
            waba_id: row.get("waba_id"),
            access_token: row.get("access_token"),
            endpoint: row.get("endpoint"),
            fees_template_name: row.get("fees_template_name"),
            marks_template_name: row.get("marks_template_name"),
            lock_password: row.get("lock_password"),
        }))
    }

    async fn upsert(&self, settings: &Settings) -> Result<(), NotifyError> {
        sqlx::query(
            r#"
            INSERT INTO edualert.settings
            (id, phone_number_id, waba_id, access_token, endpoint,
             fees_template_name, marks_template_name, lock_password)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (id) DO UPDATE
            SET phone_number_id = EXCLUDED.phone_number_id,
                waba_id = EXCLUDED.waba_id,
                access_token = EXCLUDED.access_token,
                endpoint = EXCLUDED.endpoint,
                fees_template_name = EXCLUDED.fees_template_name,
                marks_template_name = EXCLUDED.marks_template_name,
                lock_password = EXCLUDED.lock_password,
                updated_at = now()
            "#,
        )
        .bind(SETTINGS_ID)
        .bind(&settings.phone_number_id)
        .bind(&settings.waba_id)
        .bind(&settings.access_token)
        .bind(&settings.endpoint)
        .bind(&settings.fees_template_name)
        .bind(&settings.marks_template_name)
        .bind(&settings.lock_password)
        .execute(&self.pool)
        .await?;

        tracing::info!("settings saved");
        Ok(())
    }
}

/// Fields a saved settings record must carry.
pub const REQUIRED_ON_SAVE: [&str; 6] = [
    "phone_number_id",
    "waba_id",
    "access_token",
    "endpoint",
    "fees_template_name",
    "marks_template_name",
];

/// Rejects a record with blank required fields before it is written.
pub async fn save_settings<S>(store: &S, settings: &Settings) -> Result<(), NotifyError>
where
    S: SettingsStore + ?Sized,
{
    let missing = settings.blank_fields(&REQUIRED_ON_SAVE);
    if !missing.is_empty() {
        return Err(NotifyError::IncompleteSettings { missing });
    }
    store.upsert(settings).await
}

#[cfg(test)]
pub(crate) mod memory {
    use std::sync::Mutex;

    use super::*;

    /// In-process store for tests.
    #[derive(Default)]
    pub struct MemoryStore {
        settings: Mutex<Option<Settings>>,
    }

    impl MemoryStore {
        pub fn with(settings: Settings) -> Self {
            Self {
                settings: Mutex::new(Some(settings)),
            }
        }
    }

    #[async_trait]
    impl SettingsStore for MemoryStore {
        async fn load(&self) -> Result<Option<Settings>, NotifyError> {
            Ok(self.settings.lock().expect("store lock").clone())
        }

        async fn upsert(&self, settings: &Settings) -> Result<(), NotifyError> {
            *self.settings.lock().expect("store lock") = Some(settings.clone());
            Ok(())
        }
    }
}
