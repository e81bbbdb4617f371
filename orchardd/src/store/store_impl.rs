impl StateStore {
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    #[cfg(test)]
    pub(crate) fn pool_for_tests(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn open(db_path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = db_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true);
        let pool = SqlitePool::connect_with(options).await?;
        let store = Self { pool };
        store.init().await?;
        Ok(store)
    }

    pub async fn init(&self) -> Result<(), StoreError> {
        MIGRATOR.run(&self.pool).await?;
        self.ensure_root().await?;
        Ok(())
    }

    async fn ensure_root(&self) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT OR IGNORE INTO objects (id, kind, parent_id, name, cloud_id, origin, sync_state, last_synced)
             VALUES (?1, 'folder', NULL, '', ?2, 'cloud', 'synced', 0)",
        )
        .bind(ROOT_OBJECT_ID)
        .bind(CLOUD_ROOT_ID)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Objects
    // ------------------------------------------------------------------

    pub async fn get_object(&self, id: &str) -> Result<Option<ObjectRecord>, StoreError> {
        let row = sqlx::query(&format!("SELECT {OBJECT_COLUMNS} FROM objects WHERE id = ?1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(object_from_row).transpose()
    }

    pub async fn get_object_by_cloud_id(
        &self,
        cloud_id: &str,
    ) -> Result<Option<ObjectRecord>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {OBJECT_COLUMNS} FROM objects WHERE cloud_id = ?1"
        ))
        .bind(cloud_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(object_from_row).transpose()
    }

    /// Walks the tree from the root by `(parent_id, name, extension)`.
    /// Case-sensitive.
    pub async fn resolve_path(&self, path: &str) -> Result<Option<ObjectRecord>, StoreError> {
        let mut current = match self.get_object(ROOT_OBJECT_ID).await? {
            Some(root) => root,
            None => return Ok(None),
        };
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            let Some(child) = self.find_child(&current.id, segment).await? else {
                return Ok(None);
            };
            current = child;
        }
        Ok(Some(current))
    }

    pub async fn find_child(
        &self,
        parent_id: &str,
        full_name: &str,
    ) -> Result<Option<ObjectRecord>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {OBJECT_COLUMNS} FROM objects
             WHERE parent_id = ?1 AND name = ?2 AND extension IS NULL AND deleted = 0"
        ))
        .bind(parent_id)
        .bind(full_name)
        .fetch_optional(&self.pool)
        .await?;
        if let Some(row) = row {
            return Ok(Some(object_from_row(&row)?));
        }

        if let Some((stem, ext)) = full_name.rsplit_once('.') {
            if stem.is_empty() || ext.is_empty() {
                return Ok(None);
            }
            let row = sqlx::query(&format!(
                "SELECT {OBJECT_COLUMNS} FROM objects
                 WHERE parent_id = ?1 AND name = ?2 AND extension = ?3 AND deleted = 0"
            ))
            .bind(parent_id)
            .bind(stem)
            .bind(ext)
            .fetch_optional(&self.pool)
            .await?;
            return row.as_ref().map(object_from_row).transpose();
        }
        Ok(None)
    }

    /// Non-deleted children, folders and files alike.
    pub async fn list_children(&self, parent_id: &str) -> Result<Vec<ObjectRecord>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {OBJECT_COLUMNS} FROM objects
             WHERE parent_id = ?1 AND deleted = 0
             ORDER BY name ASC, extension ASC"
        ))
        .bind(parent_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(object_from_row).collect()
    }

    pub async fn create_local_object(
        &self,
        parent_id: &str,
        full_name: &str,
        kind: ObjectKind,
    ) -> Result<ObjectRecord, StoreError> {
        let parent = self
            .get_object(parent_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(parent_id.to_string()))?;
        if parent.kind != ObjectKind::Folder {
            return Err(StoreError::NotFound(parent_id.to_string()));
        }
        if self.find_child(parent_id, full_name).await?.is_some() {
            return Err(StoreError::AlreadyExists {
                parent_id: parent_id.to_string(),
                name: full_name.to_string(),
            });
        }

        let (name, extension) = split_name(full_name, kind);
        let id = mint_object_id(kind);
        let now = now_unix();
        sqlx::query(
            "INSERT INTO objects (id, kind, parent_id, name, extension, size, origin, sync_state, dirty, local_modified_at)
             VALUES (?1, ?2, ?3, ?4, ?5, 0, 'local', 'pending_push', 1, ?6)",
        )
        .bind(&id)
        .bind(kind.as_str())
        .bind(parent_id)
        .bind(&name)
        .bind(&extension)
        .bind(now)
        .execute(&self.pool)
        .await?;

        self.get_object(&id)
            .await?
            .ok_or_else(|| StoreError::NotFound(id))
    }

    /// Creates or updates an object from remote-observed metadata, keyed by
    /// `cloud_id`, and rewrites the shadow in the same transaction. Dirty
    /// objects are left untouched; the push path owns their reconciliation.
    pub async fn apply_remote_delta(
        &self,
        delta: &RemoteDelta,
    ) -> Result<ObjectRecord, StoreError> {
        let now = now_unix();
        let (name, extension) = split_name(&delta.name, delta.kind);
        let existing = self.get_object_by_cloud_id(&delta.cloud_id).await?;

        let mut tx = self.pool.begin().await?;
        let object_id = match &existing {
            Some(existing) if existing.dirty => {
                tx.commit().await?;
                return Ok(existing.clone());
            }
            Some(existing) => {
                sqlx::query(
                    "UPDATE objects
                     SET parent_id = ?1, name = ?2, extension = ?3, size = COALESCE(?4, size),
                         etag = ?5, revision = COALESCE(?6, revision), cloud_parent_id = ?7,
                         cloud_modified_at = COALESCE(?8, cloud_modified_at),
                         missing_from_cloud = 0, last_synced = ?9
                     WHERE id = ?10",
                )
                .bind(&delta.parent_id)
                .bind(&name)
                .bind(&extension)
                .bind(delta.size)
                .bind(&delta.etag)
                .bind(&delta.revision)
                .bind(&delta.cloud_parent_id)
                .bind(delta.cloud_modified_at)
                .bind(now)
                .bind(&existing.id)
                .execute(&mut *tx)
                .await?;
                existing.id.clone()
            }
            None => {
                let id = mint_object_id(delta.kind);
                sqlx::query(
                    "INSERT INTO objects (id, kind, parent_id, name, extension, size, cloud_id, cloud_parent_id, etag, revision, cloud_modified_at, origin, sync_state, last_synced)
                     VALUES (?1, ?2, ?3, ?4, ?5, COALESCE(?6, 0), ?7, ?8, ?9, ?10, COALESCE(?11, 0), 'cloud', 'synced', ?12)",
                )
                .bind(&id)
                .bind(delta.kind.as_str())
                .bind(&delta.parent_id)
                .bind(&name)
                .bind(&extension)
                .bind(delta.size)
                .bind(&delta.cloud_id)
                .bind(&delta.cloud_parent_id)
                .bind(&delta.etag)
                .bind(&delta.revision)
                .bind(delta.cloud_modified_at)
                .bind(now)
                .execute(&mut *tx)
                .await?;
                id
            }
        };

        sqlx::query(
            "INSERT INTO shadows (object_id, cloud_id, parent_id, name, etag, file_hash, modified_at)
             VALUES (?1, ?2, ?3, ?4, ?5, NULL, ?6)
             ON CONFLICT(object_id) DO UPDATE SET
                cloud_id = excluded.cloud_id,
                parent_id = excluded.parent_id,
                name = excluded.name,
                etag = excluded.etag,
                modified_at = excluded.modified_at",
        )
        .bind(&object_id)
        .bind(&delta.cloud_id)
        .bind(&delta.parent_id)
        .bind(&delta.name)
        .bind(&delta.etag)
        .bind(now)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        self.get_object(&object_id)
            .await?
            .ok_or(StoreError::NotFound(object_id))
    }

    /// Idempotent: a dirty object stays dirty, timestamps still advance.
    pub async fn mark_dirty(&self, id: &str) -> Result<(), StoreError> {
        let object = self
            .get_object(id)
            .await?
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        if !object.sync_state.allows(SyncState::Dirty) {
            return Err(StoreError::InvalidTransition {
                from: object.sync_state,
                to: SyncState::Dirty,
            });
        }
        sqlx::query(
            "UPDATE objects SET dirty = 1, sync_state = 'dirty', local_modified_at = ?1 WHERE id = ?2",
        )
        .bind(now_unix())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn set_sync_state(&self, id: &str, next: SyncState) -> Result<(), StoreError> {
        let object = self
            .get_object(id)
            .await?
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        if !object.sync_state.allows(next) {
            return Err(StoreError::InvalidTransition {
                from: object.sync_state,
                to: next,
            });
        }
        sqlx::query("UPDATE objects SET sync_state = ?1 WHERE id = ?2")
            .bind(next.as_str())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn update_local_size(&self, id: &str, size: i64) -> Result<(), StoreError> {
        sqlx::query("UPDATE objects SET size = ?1 WHERE id = ?2")
            .bind(size)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Rewrites the projected identity of an object (rename and/or move).
    pub async fn relocate_object(
        &self,
        id: &str,
        new_parent_id: &str,
        new_full_name: &str,
    ) -> Result<(), StoreError> {
        let object = self
            .get_object(id)
            .await?
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        if object.id == ROOT_OBJECT_ID {
            return Err(StoreError::RootImmutable);
        }
        if let Some(existing) = self.find_child(new_parent_id, new_full_name).await? {
            if existing.id != id {
                return Err(StoreError::AlreadyExists {
                    parent_id: new_parent_id.to_string(),
                    name: new_full_name.to_string(),
                });
            }
        }
        let (name, extension) = split_name(new_full_name, object.kind);
        sqlx::query(
            "UPDATE objects SET parent_id = ?1, name = ?2, extension = ?3, dirty = 1, local_modified_at = ?4 WHERE id = ?5",
        )
        .bind(new_parent_id)
        .bind(&name)
        .bind(&extension)
        .bind(now_unix())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn apply_upload_success(
        &self,
        id: &str,
        cloud_id: &str,
        etag: &str,
        revision: Option<&str>,
        size: Option<i64>,
        file_hash: Option<&str>,
        cloud_parent_id: Option<&str>,
    ) -> Result<(), StoreError> {
        let now = now_unix();
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "UPDATE objects
             SET cloud_id = ?1, etag = ?2, revision = COALESCE(?3, revision),
                 size = COALESCE(?4, size), cloud_parent_id = COALESCE(?5, cloud_parent_id),
                 missing_from_cloud = 0, dirty = 0, sync_state = 'synced', last_synced = ?6
             WHERE id = ?7",
        )
        .bind(cloud_id)
        .bind(etag)
        .bind(revision)
        .bind(size)
        .bind(cloud_parent_id)
        .bind(now)
        .bind(id)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "INSERT INTO shadows (object_id, cloud_id, parent_id, name, etag, file_hash, modified_at)
             SELECT id, ?1, parent_id, name, ?2, ?3, ?4 FROM objects WHERE id = ?5
             ON CONFLICT(object_id) DO UPDATE SET
                cloud_id = excluded.cloud_id,
                parent_id = excluded.parent_id,
                name = excluded.name,
                etag = excluded.etag,
                file_hash = COALESCE(excluded.file_hash, shadows.file_hash),
                modified_at = excluded.modified_at",
        )
        .bind(cloud_id)
        .bind(etag)
        .bind(file_hash)
        .bind(now)
        .bind(id)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "UPDATE cache_entries SET file_hash = COALESCE(?1, file_hash), size = COALESCE(?2, size) WHERE object_id = ?3",
        )
        .bind(file_hash)
        .bind(size)
        .bind(id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn apply_download_success(
        &self,
        id: &str,
        etag: Option<&str>,
        revision: Option<&str>,
        size: i64,
        file_hash: &str,
    ) -> Result<(), StoreError> {
        let now = now_unix();
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "UPDATE objects
             SET etag = COALESCE(?1, etag), revision = COALESCE(?2, revision), size = ?3,
                 last_synced = ?4,
                 sync_state = CASE WHEN dirty = 0 THEN 'synced' ELSE sync_state END
             WHERE id = ?5",
        )
        .bind(etag)
        .bind(revision)
        .bind(size)
        .bind(now)
        .bind(id)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "INSERT INTO shadows (object_id, cloud_id, parent_id, name, etag, file_hash, modified_at)
             SELECT id, cloud_id, parent_id, name, COALESCE(?1, etag), ?2, ?3 FROM objects WHERE id = ?4
             ON CONFLICT(object_id) DO UPDATE SET
                cloud_id = excluded.cloud_id,
                etag = excluded.etag,
                file_hash = excluded.file_hash,
                modified_at = excluded.modified_at",
        )
        .bind(etag)
        .bind(file_hash)
        .bind(now)
        .bind(id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn mark_deleted(&self, id: &str, direction: Direction) -> Result<(), StoreError> {
        if id == ROOT_OBJECT_ID {
            return Err(StoreError::RootImmutable);
        }
        let state = match direction {
            Direction::Push => SyncState::DeletedLocal,
            Direction::Pull => SyncState::DeletedCloud,
        };
        let object = self
            .get_object(id)
            .await?
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        if !object.sync_state.allows(state) {
            return Err(StoreError::InvalidTransition {
                from: object.sync_state,
                to: state,
            });
        }
        sqlx::query(
            "UPDATE objects SET deleted = 1, sync_state = ?1, local_modified_at = ?2 WHERE id = ?3",
        )
        .bind(state.as_str())
        .bind(now_unix())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Settles the flags after confirming local and remote content already
    /// agree (no network mutation happened).
    pub async fn mark_synced_noop(&self, id: &str) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE objects SET dirty = 0, sync_state = 'synced', last_synced = ?1 WHERE id = ?2",
        )
        .bind(now_unix())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn clear_dirty_flag(&self, id: &str) -> Result<(), StoreError> {
        sqlx::query("UPDATE objects SET dirty = 0 WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Records the folder as freshly listed; `readdir` staleness checks key
    /// off this timestamp.
    pub async fn mark_listed(&self, id: &str) -> Result<(), StoreError> {
        sqlx::query("UPDATE objects SET last_synced = ?1 WHERE id = ?2")
            .bind(now_unix())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Cancels a local delete: the remote version won and will be pulled.
    pub async fn restore_object(&self, id: &str) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE objects SET deleted = 0, dirty = 0, sync_state = 'pending_pull', local_modified_at = ?1 WHERE id = ?2",
        )
        .bind(now_unix())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn apply_rename_success(
        &self,
        id: &str,
        new_full_name: &str,
        etag: &str,
        revision: Option<&str>,
    ) -> Result<(), StoreError> {
        let object = self
            .get_object(id)
            .await?
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        let (name, extension) = split_name(new_full_name, object.kind);
        let now = now_unix();
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "UPDATE objects SET name = ?1, extension = ?2, etag = ?3, revision = COALESCE(?4, revision),
                    dirty = 0, sync_state = 'synced', last_synced = ?5
             WHERE id = ?6",
        )
        .bind(&name)
        .bind(&extension)
        .bind(etag)
        .bind(revision)
        .bind(now)
        .bind(id)
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            "UPDATE shadows SET name = ?1, etag = ?2, modified_at = ?3 WHERE object_id = ?4",
        )
        .bind(new_full_name)
        .bind(etag)
        .bind(now)
        .bind(id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn apply_move_success(
        &self,
        id: &str,
        new_parent_id: &str,
        new_parent_cloud_id: &str,
        etag: &str,
        revision: Option<&str>,
    ) -> Result<(), StoreError> {
        let now = now_unix();
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "UPDATE objects SET parent_id = ?1, cloud_parent_id = ?2, etag = ?3,
                    revision = COALESCE(?4, revision), dirty = 0, sync_state = 'synced', last_synced = ?5
             WHERE id = ?6",
        )
        .bind(new_parent_id)
        .bind(new_parent_cloud_id)
        .bind(etag)
        .bind(revision)
        .bind(now)
        .bind(id)
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            "UPDATE shadows SET parent_id = ?1, etag = ?2, modified_at = ?3 WHERE object_id = ?4",
        )
        .bind(new_parent_id)
        .bind(etag)
        .bind(now)
        .bind(id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn mark_missing_from_cloud(&self, id: &str) -> Result<(), StoreError> {
        sqlx::query("UPDATE objects SET missing_from_cloud = 1 WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Removes the tombstone once both sides have confirmed the deletion.
    pub async fn purge_object(&self, id: &str) -> Result<(), StoreError> {
        if id == ROOT_OBJECT_ID {
            return Err(StoreError::RootImmutable);
        }
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM chunks WHERE object_id = ?1")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM cache_entries WHERE object_id = ?1")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM shadows WHERE object_id = ?1")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM actions WHERE target_id = ?1")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM objects WHERE id = ?1")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Appends an audit note recording a remote object displaced by Local Wins.
    pub async fn append_conflict_history(
        &self,
        id: &str,
        displaced_cloud_id: &str,
        displaced_etag: Option<&str>,
    ) -> Result<(), StoreError> {
        let object = self
            .get_object(id)
            .await?
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        let mut history: Vec<serde_json::Value> = object
            .conflict_history
            .as_deref()
            .and_then(|raw| serde_json::from_str(raw).ok())
            .unwrap_or_default();
        history.push(serde_json::json!({
            "displaced_cloud_id": displaced_cloud_id,
            "etag": displaced_etag,
            "at": now_unix(),
        }));
        let serialized =
            serde_json::to_string(&history).unwrap_or_else(|_| "[]".to_string());
        sqlx::query("UPDATE objects SET conflict_history = ?1 WHERE id = ?2")
            .bind(serialized)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Projected absolute path of an object, built by walking parent links.
    pub async fn object_path(&self, id: &str) -> Result<String, StoreError> {
        let mut current = self
            .get_object(id)
            .await?
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        let mut parts = Vec::new();
        while let Some(parent_id) = current.parent_id.clone() {
            parts.push(current.full_name());
            current = self
                .get_object(&parent_id)
                .await?
                .ok_or(StoreError::NotFound(parent_id))?;
        }
        parts.reverse();
        Ok(format!("/{}", parts.join("/")))
    }

    pub async fn list_objects_in_state(
        &self,
        state: SyncState,
    ) -> Result<Vec<ObjectRecord>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {OBJECT_COLUMNS} FROM objects WHERE sync_state = ?1 ORDER BY id ASC"
        ))
        .bind(state.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(object_from_row).collect()
    }

    pub async fn count_objects_in_state(&self, state: SyncState) -> Result<i64, StoreError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM objects WHERE sync_state = ?1")
            .bind(state.as_str())
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("n")?)
    }

    // ------------------------------------------------------------------
    // Shadows
    // ------------------------------------------------------------------

    pub async fn get_shadow(&self, object_id: &str) -> Result<Option<ShadowRecord>, StoreError> {
        let row = sqlx::query(
            "SELECT object_id, cloud_id, parent_id, name, etag, file_hash, modified_at FROM shadows WHERE object_id = ?1",
        )
        .bind(object_id)
        .fetch_optional(&self.pool)
        .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        Ok(Some(ShadowRecord {
            object_id: row.try_get("object_id")?,
            cloud_id: row.try_get("cloud_id")?,
            parent_id: row.try_get("parent_id")?,
            name: row.try_get("name")?,
            etag: row.try_get("etag")?,
            file_hash: row.try_get("file_hash")?,
            modified_at: row.try_get("modified_at")?,
        }))
    }

    pub async fn upsert_shadow(&self, shadow: &ShadowRecord) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO shadows (object_id, cloud_id, parent_id, name, etag, file_hash, modified_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(object_id) DO UPDATE SET
                cloud_id = COALESCE(excluded.cloud_id, shadows.cloud_id),
                parent_id = COALESCE(excluded.parent_id, shadows.parent_id),
                name = COALESCE(excluded.name, shadows.name),
                etag = COALESCE(excluded.etag, shadows.etag),
                file_hash = COALESCE(excluded.file_hash, shadows.file_hash),
                modified_at = COALESCE(excluded.modified_at, shadows.modified_at)",
        )
        .bind(&shadow.object_id)
        .bind(&shadow.cloud_id)
        .bind(&shadow.parent_id)
        .bind(&shadow.name)
        .bind(&shadow.etag)
        .bind(&shadow.file_hash)
        .bind(shadow.modified_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn delete_shadow(&self, object_id: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM shadows WHERE object_id = ?1")
            .bind(object_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Cache rows (files owned by the cache layer, rows owned here)
    // ------------------------------------------------------------------

    pub async fn upsert_cache_entry(
        &self,
        object_id: &str,
        local_path: &str,
        size: i64,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO cache_entries (object_id, local_path, size, last_accessed)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(object_id) DO UPDATE SET
                local_path = excluded.local_path,
                size = excluded.size,
                last_accessed = excluded.last_accessed",
        )
        .bind(object_id)
        .bind(local_path)
        .bind(size)
        .bind(now_unix())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_cache_entry(
        &self,
        object_id: &str,
    ) -> Result<Option<CacheRecord>, StoreError> {
        let row = sqlx::query(
            "SELECT object_id, local_path, size, file_hash, present_locally, pinned, last_accessed, open_count
             FROM cache_entries WHERE object_id = ?1",
        )
        .bind(object_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(cache_from_row).transpose()
    }

    pub async fn set_presence(
        &self,
        object_id: &str,
        presence: Presence,
    ) -> Result<(), StoreError> {
        sqlx::query("UPDATE cache_entries SET present_locally = ?1 WHERE object_id = ?2")
            .bind(presence.as_i64())
            .bind(object_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_cache_content(
        &self,
        object_id: &str,
        presence: Presence,
        size: i64,
        file_hash: Option<&str>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE cache_entries SET present_locally = ?1, size = ?2, file_hash = COALESCE(?3, file_hash), last_accessed = ?4 WHERE object_id = ?5",
        )
        .bind(presence.as_i64())
        .bind(size)
        .bind(file_hash)
        .bind(now_unix())
        .bind(object_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn set_pinned(&self, object_id: &str, pinned: bool) -> Result<(), StoreError> {
        sqlx::query("UPDATE cache_entries SET pinned = ?1 WHERE object_id = ?2")
            .bind(if pinned { 1 } else { 0 })
            .bind(object_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn bump_open_count(&self, object_id: &str, delta: i64) -> Result<i64, StoreError> {
        sqlx::query(
            "UPDATE cache_entries SET open_count = MAX(open_count + ?1, 0), last_accessed = ?2 WHERE object_id = ?3",
        )
        .bind(delta)
        .bind(now_unix())
        .bind(object_id)
        .execute(&self.pool)
        .await?;
        let row = sqlx::query("SELECT open_count FROM cache_entries WHERE object_id = ?1")
            .bind(object_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.try_get("open_count")).transpose()?.unwrap_or(0))
    }

    pub async fn touch_access(&self, object_id: &str) -> Result<(), StoreError> {
        sqlx::query("UPDATE cache_entries SET last_accessed = ?1 WHERE object_id = ?2")
            .bind(now_unix())
            .bind(object_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn delete_cache_entry(&self, object_id: &str) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM chunks WHERE object_id = ?1")
            .bind(object_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM cache_entries WHERE object_id = ?1")
            .bind(object_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Unpinned, closed, fully cached entries, least recently used first.
    pub async fn full_eviction_candidates(&self) -> Result<Vec<CacheRecord>, StoreError> {
        let rows = sqlx::query(
            "SELECT object_id, local_path, size, file_hash, present_locally, pinned, last_accessed, open_count
             FROM cache_entries
             WHERE pinned = 0 AND open_count = 0 AND present_locally = 1
             ORDER BY last_accessed ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(cache_from_row).collect()
    }

    pub async fn list_cache_entries(&self) -> Result<Vec<CacheRecord>, StoreError> {
        let rows = sqlx::query(
            "SELECT object_id, local_path, size, file_hash, present_locally, pinned, last_accessed, open_count
             FROM cache_entries ORDER BY object_id ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(cache_from_row).collect()
    }

    // ------------------------------------------------------------------
    // Chunks
    // ------------------------------------------------------------------

    pub async fn insert_chunk(&self, object_id: &str, chunk_index: i64) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO chunks (object_id, chunk_index, last_accessed) VALUES (?1, ?2, ?3)
             ON CONFLICT(object_id, chunk_index) DO UPDATE SET last_accessed = excluded.last_accessed",
        )
        .bind(object_id)
        .bind(chunk_index)
        .bind(now_unix())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn chunk_indices(&self, object_id: &str) -> Result<Vec<i64>, StoreError> {
        let rows = sqlx::query(
            "SELECT chunk_index FROM chunks WHERE object_id = ?1 ORDER BY chunk_index ASC",
        )
        .bind(object_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|row| row.try_get::<i64, _>("chunk_index").map_err(StoreError::from))
            .collect()
    }

    pub async fn chunk_count(&self, object_id: &str) -> Result<i64, StoreError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM chunks WHERE object_id = ?1")
            .bind(object_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("n")?)
    }

    pub async fn delete_chunk(&self, object_id: &str, chunk_index: i64) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM chunks WHERE object_id = ?1 AND chunk_index = ?2")
            .bind(object_id)
            .bind(chunk_index)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn delete_chunks(&self, object_id: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM chunks WHERE object_id = ?1")
            .bind(object_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Promotes a sparse entry to full: presence flips and chunk rows purge
    /// in one transaction.
    pub async fn promote_to_full(&self, object_id: &str) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM chunks WHERE object_id = ?1")
            .bind(object_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            "UPDATE cache_entries SET present_locally = 1, last_accessed = ?1 WHERE object_id = ?2",
        )
        .bind(now_unix())
        .bind(object_id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Chunks of evictable sparse entries, oldest access first.
    pub async fn chunk_eviction_candidates(
        &self,
        limit: i64,
    ) -> Result<Vec<(String, i64)>, StoreError> {
        let rows = sqlx::query(
            "SELECT c.object_id, c.chunk_index
             FROM chunks c
             JOIN cache_entries e ON e.object_id = c.object_id
             WHERE e.pinned = 0 AND e.open_count = 0
             ORDER BY c.last_accessed ASC, c.object_id ASC, c.chunk_index ASC
             LIMIT ?1",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|row| {
                Ok((
                    row.try_get::<String, _>("object_id")?,
                    row.try_get::<i64, _>("chunk_index")?,
                ))
            })
            .collect()
    }

    // ------------------------------------------------------------------
    // Action queue
    // ------------------------------------------------------------------

    /// Inserts an action, applying the coalescing rules in the same
    /// transaction. Returns `None` when the intent was absorbed by an
    /// already-queued action.
    pub async fn enqueue_action(&self, action: &NewAction) -> Result<Option<i64>, StoreError> {
        let metadata = action
            .metadata
            .as_ref()
            .map(|value| value.to_string());
        let mut tx = self.pool.begin().await?;

        match action.action_type {
            ActionType::ListChildren
            | ActionType::EnsureLatest
            | ActionType::Download
            | ActionType::DownloadChunk => {
                // Exact duplicates (same target, type and payload) dedup;
                // a pending duplicate inherits the higher priority.
                let row = sqlx::query(
                    "SELECT action_id, status FROM actions
                     WHERE target_id = ?1 AND action_type = ?2
                       AND COALESCE(metadata, '') = COALESCE(?3, '')
                       AND status IN ('pending', 'processing')
                     LIMIT 1",
                )
                .bind(&action.target_id)
                .bind(action.action_type.as_str())
                .bind(&metadata)
                .fetch_optional(&mut *tx)
                .await?;
                if let Some(row) = row {
                    let action_id: i64 = row.try_get("action_id")?;
                    let status: String = row.try_get("status")?;
                    if status == "pending" {
                        sqlx::query(
                            "UPDATE actions SET priority = MAX(priority, ?1) WHERE action_id = ?2",
                        )
                        .bind(action.priority)
                        .bind(action_id)
                        .execute(&mut *tx)
                        .await?;
                    }
                    tx.commit().await?;
                    return Ok(None);
                }
            }
            ActionType::UpdateContent => {
                let row = sqlx::query(
                    "SELECT action_id FROM actions
                     WHERE target_id = ?1 AND status = 'pending'
                       AND action_type IN ('update_content', 'upload')
                     ORDER BY action_id ASC LIMIT 1",
                )
                .bind(&action.target_id)
                .fetch_optional(&mut *tx)
                .await?;
                if let Some(row) = row {
                    let action_id: i64 = row.try_get("action_id")?;
                    sqlx::query(
                        "UPDATE actions SET metadata = COALESCE(?1, metadata), priority = MAX(priority, ?2),
                                retry_count = 0, not_before = NULL, last_error = NULL
                         WHERE action_id = ?3",
                    )
                    .bind(&metadata)
                    .bind(action.priority)
                    .bind(action_id)
                    .execute(&mut *tx)
                    .await?;
                    tx.commit().await?;
                    return Ok(Some(action_id));
                }
            }
            ActionType::Upload => {
                // A fresh upload supersedes any not-yet-pushed content update.
                sqlx::query(
                    "DELETE FROM actions WHERE target_id = ?1 AND status = 'pending' AND action_type = 'update_content'",
                )
                .bind(&action.target_id)
                .execute(&mut *tx)
                .await?;
                let row = sqlx::query(
                    "SELECT action_id FROM actions
                     WHERE target_id = ?1 AND status = 'pending' AND action_type = 'upload'
                     LIMIT 1",
                )
                .bind(&action.target_id)
                .fetch_optional(&mut *tx)
                .await?;
                if let Some(row) = row {
                    let action_id: i64 = row.try_get("action_id")?;
                    sqlx::query(
                        "UPDATE actions SET metadata = COALESCE(?1, metadata), priority = MAX(priority, ?2),
                                retry_count = 0, not_before = NULL, last_error = NULL
                         WHERE action_id = ?3",
                    )
                    .bind(&metadata)
                    .bind(action.priority)
                    .bind(action_id)
                    .execute(&mut *tx)
                    .await?;
                    tx.commit().await?;
                    return Ok(Some(action_id));
                }
            }
            ActionType::Rename | ActionType::Move => {
                // Consecutive renames/moves collapse; the last destination wins.
                let row = sqlx::query(
                    "SELECT action_id FROM actions
                     WHERE target_id = ?1 AND status = 'pending' AND action_type = ?2
                     LIMIT 1",
                )
                .bind(&action.target_id)
                .bind(action.action_type.as_str())
                .fetch_optional(&mut *tx)
                .await?;
                if let Some(row) = row {
                    let action_id: i64 = row.try_get("action_id")?;
                    sqlx::query(
                        "UPDATE actions SET destination = ?1, metadata = COALESCE(?2, metadata),
                                retry_count = 0, not_before = NULL, last_error = NULL
                         WHERE action_id = ?3",
                    )
                    .bind(&action.destination)
                    .bind(&metadata)
                    .bind(action_id)
                    .execute(&mut *tx)
                    .await?;
                    tx.commit().await?;
                    return Ok(Some(action_id));
                }
            }
            ActionType::Delete => {
                // Deleting the object cancels every pending push for it.
                sqlx::query(
                    "DELETE FROM actions WHERE target_id = ?1 AND status = 'pending' AND direction = 'push' AND action_type != 'delete'",
                )
                .bind(&action.target_id)
                .execute(&mut *tx)
                .await?;
                let row = sqlx::query(
                    "SELECT action_id FROM actions
                     WHERE target_id = ?1 AND status IN ('pending', 'processing') AND action_type = 'delete'
                     LIMIT 1",
                )
                .bind(&action.target_id)
                .fetch_optional(&mut *tx)
                .await?;
                if row.is_some() {
                    tx.commit().await?;
                    return Ok(None);
                }
            }
        }

        let result = sqlx::query(
            "INSERT INTO actions (action_type, target_id, destination, metadata, direction, priority, status, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'pending', ?7)",
        )
        .bind(action.action_type.as_str())
        .bind(&action.target_id)
        .bind(&action.destination)
        .bind(&metadata)
        .bind(action.direction.as_str())
        .bind(action.priority)
        .bind(now_unix())
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(Some(result.last_insert_rowid()))
    }

    /// Claims the runnable action with the highest priority (FIFO within a
    /// priority), skipping targets that already have a processing action so
    /// per-object order stays serial.
    pub async fn claim_next(
        &self,
        worker_id: &str,
        lane: Lane,
    ) -> Result<Option<ActionRecord>, StoreError> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query(&format!(
            "SELECT {ACTION_COLUMNS} FROM actions
             WHERE status = 'pending'
               AND action_type IN {}
               AND (not_before IS NULL OR not_before <= ?1)
               AND target_id NOT IN (SELECT target_id FROM actions WHERE status = 'processing')
             ORDER BY priority DESC, created_at ASC, action_id ASC
             LIMIT 1",
            lane.sql_set()
        ))
        .bind(now_unix())
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            tx.commit().await?;
            return Ok(None);
        };
        let action = action_from_row(&row)?;
        sqlx::query("UPDATE actions SET status = 'processing', worker_id = ?1 WHERE action_id = ?2")
            .bind(worker_id)
            .bind(action.action_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(Some(action))
    }

    pub async fn complete_action(&self, action_id: i64) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM actions WHERE action_id = ?1")
            .bind(action_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Records a failure. Within the retry budget the action goes back to
    /// `pending` gated by `not_before`; past it the action is parked as
    /// `failed` and the target object surfaces `sync_state = error`.
    pub async fn fail_action(
        &self,
        action_id: i64,
        target_id: &str,
        error: &str,
        not_before: i64,
        max_retries: i64,
    ) -> Result<FailOutcome, StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "UPDATE actions SET retry_count = retry_count + 1, last_error = ?1 WHERE action_id = ?2",
        )
        .bind(error)
        .bind(action_id)
        .execute(&mut *tx)
        .await?;
        let row = sqlx::query("SELECT retry_count FROM actions WHERE action_id = ?1")
            .bind(action_id)
            .fetch_one(&mut *tx)
            .await?;
        let retry_count: i64 = row.try_get("retry_count")?;

        let outcome = if retry_count >= max_retries {
            sqlx::query(
                "UPDATE actions SET status = 'failed', worker_id = NULL, not_before = NULL WHERE action_id = ?1",
            )
            .bind(action_id)
            .execute(&mut *tx)
            .await?;
            sqlx::query("UPDATE objects SET sync_state = 'error' WHERE id = ?1")
                .bind(target_id)
                .execute(&mut *tx)
                .await?;
            FailOutcome::Exhausted
        } else {
            sqlx::query(
                "UPDATE actions SET status = 'pending', worker_id = NULL, not_before = ?1 WHERE action_id = ?2",
            )
            .bind(not_before)
            .bind(action_id)
            .execute(&mut *tx)
            .await?;
            FailOutcome::Requeued { not_before }
        };
        tx.commit().await?;
        Ok(outcome)
    }

    /// Releases a claimed action without counting a retry (used when a
    /// worker declines an action it cannot run yet).
    pub async fn release_action(&self, action_id: i64, not_before: i64) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE actions SET status = 'pending', worker_id = NULL, not_before = ?1 WHERE action_id = ?2",
        )
        .bind(not_before)
        .bind(action_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Startup recovery: actions claimed by a dead worker return to pending.
    pub async fn recover_orphaned_actions(&self) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "UPDATE actions SET status = 'pending', worker_id = NULL WHERE status = 'processing'",
        )
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn pending_action_exists(
        &self,
        target_id: &str,
        action_type: ActionType,
    ) -> Result<bool, StoreError> {
        let row = sqlx::query(
            "SELECT 1 FROM actions WHERE target_id = ?1 AND action_type = ?2 AND status IN ('pending', 'processing') LIMIT 1",
        )
        .bind(target_id)
        .bind(action_type.as_str())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.is_some())
    }

    pub async fn count_actions_with_status(&self, status: &str) -> Result<i64, StoreError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM actions WHERE status = ?1")
            .bind(status)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("n")?)
    }

    pub async fn list_failed_actions(&self) -> Result<Vec<ActionRecord>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {ACTION_COLUMNS} FROM actions WHERE status = 'failed' ORDER BY action_id ASC"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(action_from_row).collect()
    }

    pub async fn has_ready_action(&self) -> Result<bool, StoreError> {
        let row = sqlx::query(
            "SELECT 1 FROM actions
             WHERE status = 'pending' AND (not_before IS NULL OR not_before <= ?1)
             LIMIT 1",
        )
        .bind(now_unix())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.is_some())
    }
}

fn cache_from_row(row: &SqliteRow) -> Result<CacheRecord, StoreError> {
    let present: i64 = row.try_get("present_locally")?;
    let pinned: i64 = row.try_get("pinned")?;
    Ok(CacheRecord {
        object_id: row.try_get("object_id")?,
        local_path: row.try_get("local_path")?,
        size: row.try_get("size")?,
        file_hash: row.try_get("file_hash")?,
        present_locally: Presence::parse(present)?,
        pinned: pinned != 0,
        last_accessed: row.try_get("last_accessed")?,
        open_count: row.try_get("open_count")?,
    })
}
