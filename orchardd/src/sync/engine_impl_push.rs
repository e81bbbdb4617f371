impl<R: RemoteAdapter> SyncEngine<R> {
    /// Pushes local content. A bound object gets a conditional update; an
    /// unbound one is uploaded fresh, displacing any remote sibling with the
    /// same name (Local Wins).
    async fn execute_upload(&self, object: &ObjectRecord) -> Result<(), EngineError> {
        if object.deleted {
            return Ok(());
        }
        if object.kind == ObjectKind::Folder {
            return self.execute_folder_upload(object).await;
        }

        let entry = self
            .store
            .get_cache_entry(&object.id)
            .await?
            .ok_or_else(|| EngineError::MissingCacheContent(object.id.clone()))?;
        match entry.present_locally {
            crate::store::Presence::Full => {}
            crate::store::Presence::Sparse => {
                // Upload is deferred until promotion completes; writes to a
                // sparse file keep the object dirty in the meantime.
                for index in self
                    .cache
                    .missing_chunks(&object.id, 0, object.size.max(0) as u64, object.size.max(0) as u64)
                    .await?
                {
                    self.store
                        .enqueue_action(&NewAction::download_chunk(
                            &object.id,
                            index,
                            PRIORITY_INTERACTIVE,
                        ))
                        .await?;
                }
                return Err(EngineError::NotReady(format!(
                    "{} is sparse; waiting for promotion",
                    object.id
                )));
            }
            crate::store::Presence::Absent => {
                return Err(EngineError::MissingCacheContent(object.id.clone()));
            }
        }

        let content_hash = self.cache.content_hash(&object.id).await?;
        let shadow = self.store.get_shadow(&object.id).await?;
        if let (Some(shadow), Some(hash), Some(_)) =
            (&shadow, &content_hash, object.cloud_id.as_ref())
        {
            if shadow.file_hash.as_deref() == Some(hash.as_str()) && !object.missing_from_cloud {
                // Content already on the remote; just settle the flags.
                self.store.mark_synced_noop(&object.id).await?;
                return Ok(());
            }
        }

        let parent_cloud_id = self.parent_cloud_id(object).await?;
        let full_name = object.full_name();
        let staged = self.cache.stage_upload(&object.id, &full_name).await?;

        if let Some(cloud_id) = object.cloud_id.as_deref() {
            if !object.missing_from_cloud {
                let if_match = shadow
                    .as_ref()
                    .and_then(|s| s.etag.clone())
                    .or_else(|| object.etag.clone())
                    .unwrap_or_default();
                return match self.remote.update(cloud_id, staged.path(), &if_match).await {
                    Ok(result) => {
                        self.store
                            .apply_upload_success(
                                &object.id,
                                &result.cloud_id,
                                &result.etag,
                                result.revision.as_deref(),
                                Some(object.size),
                                content_hash.as_deref(),
                                Some(&parent_cloud_id),
                            )
                            .await?;
                        Ok(())
                    }
                    Err(RemoteError::PreconditionFailed) => {
                        self.settle_content_conflict(
                            object,
                            cloud_id,
                            &parent_cloud_id,
                            &full_name,
                            staged.path(),
                            content_hash.as_deref(),
                        )
                        .await
                    }
                    Err(RemoteError::NotFound) => {
                        // Pushed against a ghost: re-enqueue as a fresh upload.
                        self.store.mark_missing_from_cloud(&object.id).await?;
                        self.store
                            .enqueue_action(&NewAction::upload(&object.id))
                            .await?;
                        Ok(())
                    }
                    Err(err) => Err(err.into()),
                };
            }
        }

        // Fresh upload. A same-named remote sibling is some other object
        // (shadow-detectable): Local Wins displaces it first.
        let siblings = self.remote.list(&parent_cloud_id).await?;
        if let Some(other) = siblings.iter().find(|entry| {
            entry.name == full_name && Some(entry.cloud_id.as_str()) != object.cloud_id.as_deref()
        }) {
            eprintln!(
                "[orchardd] upload displacing remote sibling {} of {}",
                other.cloud_id, object.id
            );
            match self
                .remote
                .delete(&other.cloud_id, other.etag.as_deref())
                .await
            {
                Ok(()) | Err(RemoteError::NotFound) => {}
                Err(err) => return Err(err.into()),
            }
            self.store
                .append_conflict_history(&object.id, &other.cloud_id, other.etag.as_deref())
                .await?;
        }

        let result = self
            .remote
            .upload(&parent_cloud_id, &full_name, staged.path(), None)
            .await?;
        self.store
            .apply_upload_success(
                &object.id,
                &result.cloud_id,
                &result.etag,
                result.revision.as_deref(),
                Some(object.size),
                content_hash.as_deref(),
                Some(&parent_cloud_id),
            )
            .await?;
        Ok(())
    }

    async fn execute_folder_upload(&self, object: &ObjectRecord) -> Result<(), EngineError> {
        if object.cloud_id.is_some() && !object.missing_from_cloud {
            self.store.mark_synced_noop(&object.id).await?;
            return Ok(());
        }
        let parent_cloud_id = self.parent_cloud_id(object).await?;
        let result = self
            .remote
            .create_folder(&parent_cloud_id, &object.full_name())
            .await?;
        self.store
            .apply_upload_success(
                &object.id,
                &result.cloud_id,
                &result.etag,
                result.revision.as_deref(),
                None,
                None,
                Some(&parent_cloud_id),
            )
            .await?;
        self.store
            .enqueue_action(&NewAction::list_children(&object.id, PRIORITY_BACKGROUND))
            .await?;
        Ok(())
    }

    /// Precondition failure on a content push: the remote moved since the
    /// shadow was taken. Apply the configured policy.
    async fn settle_content_conflict(
        &self,
        object: &ObjectRecord,
        cloud_id: &str,
        parent_cloud_id: &str,
        full_name: &str,
        staged_path: &std::path::Path,
        content_hash: Option<&str>,
    ) -> Result<(), EngineError> {
        match conflict::resolve_content_conflict(self.policy) {
            Resolution::DisplaceRemote => {
                let current = self.remote.metadata(cloud_id).await?;
                match self.remote.delete(cloud_id, Some(&current.etag)).await {
                    Ok(()) | Err(RemoteError::NotFound) => {}
                    Err(err) => return Err(err.into()),
                }
                self.store
                    .append_conflict_history(&object.id, cloud_id, Some(&current.etag))
                    .await?;
                let result = self
                    .remote
                    .upload(parent_cloud_id, full_name, staged_path, None)
                    .await?;
                self.store
                    .apply_upload_success(
                        &object.id,
                        &result.cloud_id,
                        &result.etag,
                        result.revision.as_deref(),
                        Some(object.size),
                        content_hash,
                        Some(parent_cloud_id),
                    )
                    .await?;
                eprintln!(
                    "[orchardd] conflict on {} resolved local-wins: displaced {cloud_id}",
                    object.id
                );
                Ok(())
            }
            Resolution::AdoptRemote => {
                self.store.clear_dirty_flag(&object.id).await?;
                self.store
                    .set_sync_state(&object.id, SyncState::PendingPull)
                    .await?;
                self.store
                    .enqueue_action(&NewAction::download(&object.id, PRIORITY_INTERACTIVE))
                    .await?;
                eprintln!(
                    "[orchardd] conflict on {} resolved remote-wins: pulling",
                    object.id
                );
                Ok(())
            }
            Resolution::Surface => {
                self.store
                    .set_sync_state(&object.id, SyncState::Conflict)
                    .await?;
                eprintln!("[orchardd] conflict on {} surfaced for manual resolution", object.id);
                Ok(())
            }
        }
    }

    async fn execute_rename(
        &self,
        object: &ObjectRecord,
        new_full_name: &str,
    ) -> Result<(), EngineError> {
        let Some(cloud_id) = object.cloud_id.as_deref() else {
            // Nothing pushed yet; the eventual upload carries the new name.
            return Ok(());
        };
        let if_match = match self.current_if_match(object).await? {
            Some(token) => token,
            None => self.remote.metadata(cloud_id).await?.etag,
        };

        match self.remote.rename(cloud_id, new_full_name, &if_match).await {
            Ok(stamp) => {
                self.store
                    .apply_rename_success(
                        &object.id,
                        new_full_name,
                        &stamp.etag,
                        stamp.revision.as_deref(),
                    )
                    .await?;
                Ok(())
            }
            Err(RemoteError::PreconditionFailed) => {
                // Either our token is stale or the destination name collides.
                // Local Wins: remove the collider, refresh, retry once.
                let parent_cloud_id = self.parent_cloud_id(object).await?;
                let siblings = self.remote.list(&parent_cloud_id).await?;
                if let Some(collider) = siblings
                    .iter()
                    .find(|entry| entry.name == new_full_name && entry.cloud_id != cloud_id)
                {
                    match self
                        .remote
                        .delete(&collider.cloud_id, collider.etag.as_deref())
                        .await
                    {
                        Ok(()) | Err(RemoteError::NotFound) => {}
                        Err(err) => return Err(err.into()),
                    }
                    self.store
                        .append_conflict_history(
                            &object.id,
                            &collider.cloud_id,
                            collider.etag.as_deref(),
                        )
                        .await?;
                }
                let fresh = self.remote.metadata(cloud_id).await?;
                let stamp = self
                    .remote
                    .rename(cloud_id, new_full_name, &fresh.etag)
                    .await?;
                self.store
                    .apply_rename_success(
                        &object.id,
                        new_full_name,
                        &stamp.etag,
                        stamp.revision.as_deref(),
                    )
                    .await?;
                Ok(())
            }
            Err(RemoteError::NotFound) => {
                self.store.mark_missing_from_cloud(&object.id).await?;
                self.store
                    .enqueue_action(&NewAction::upload(&object.id))
                    .await?;
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn execute_move(
        &self,
        object: &ObjectRecord,
        new_parent_id: &str,
    ) -> Result<(), EngineError> {
        let Some(cloud_id) = object.cloud_id.as_deref() else {
            return Ok(());
        };
        let new_parent = self.require_object(new_parent_id).await?;
        let Some(new_parent_cloud_id) = new_parent.cloud_id.as_deref() else {
            return Err(EngineError::NotReady(format!(
                "destination folder {new_parent_id} is not on the remote yet"
            )));
        };
        let if_match = match self.current_if_match(object).await? {
            Some(token) => token,
            None => self.remote.metadata(cloud_id).await?.etag,
        };

        match self
            .remote
            .move_item(cloud_id, new_parent_cloud_id, &if_match)
            .await
        {
            Ok(stamp) => {
                self.store
                    .apply_move_success(
                        &object.id,
                        new_parent_id,
                        new_parent_cloud_id,
                        &stamp.etag,
                        stamp.revision.as_deref(),
                    )
                    .await?;
                Ok(())
            }
            Err(RemoteError::PreconditionFailed) => {
                let fresh = self.remote.metadata(cloud_id).await?;
                let stamp = self
                    .remote
                    .move_item(cloud_id, new_parent_cloud_id, &fresh.etag)
                    .await?;
                self.store
                    .apply_move_success(
                        &object.id,
                        new_parent_id,
                        new_parent_cloud_id,
                        &stamp.etag,
                        stamp.revision.as_deref(),
                    )
                    .await?;
                Ok(())
            }
            Err(RemoteError::NotFound) => {
                self.store.mark_missing_from_cloud(&object.id).await?;
                self.store
                    .enqueue_action(&NewAction::upload(&object.id))
                    .await?;
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Deletes run in both directions. Push: remote delete conditional on
    /// the shadow, then the tombstone is dropped. Pull: the local projection
    /// is removed, the tombstone row stays for idempotency.
    async fn execute_delete(&self, target_id: &str) -> Result<(), EngineError> {
        let Some(object) = self.store.get_object(target_id).await? else {
            // Tombstone already purged; replaying the action is a no-op.
            return Ok(());
        };

        match object.sync_state {
            SyncState::DeletedLocal => {
                if let Some(cloud_id) = object.cloud_id.as_deref() {
                    let if_match = self.current_if_match(&object).await?;
                    match self.remote.delete(cloud_id, if_match.as_deref()).await {
                        Ok(()) | Err(RemoteError::NotFound) => {}
                        Err(RemoteError::PreconditionFailed) => {
                            return self.settle_delete_conflict(&object).await;
                        }
                        Err(err) => return Err(err.into()),
                    }
                }
                self.cache.remove_content(&object.id).await?;
                self.store.purge_object(&object.id).await?;
                Ok(())
            }
            SyncState::DeletedCloud => {
                let open_count = self
                    .store
                    .get_cache_entry(&object.id)
                    .await?
                    .map(|entry| entry.open_count)
                    .unwrap_or(0);
                if open_count > 0 {
                    // Still open through FUSE; content survives until the
                    // last release purges it.
                    return Ok(());
                }
                self.cache.remove_content(&object.id).await?;
                self.store.delete_shadow(&object.id).await?;
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Local delete vs remote edit: the default restores the remote version
    /// and cancels the local delete.
    async fn settle_delete_conflict(&self, object: &ObjectRecord) -> Result<(), EngineError> {
        match conflict::resolve_delete_conflict(self.policy, DeleteConflict::LocalDeleteRemoteEdit)
        {
            DeleteResolution::RestoreRemote | DeleteResolution::RepushAsNew => {
                self.store.restore_object(&object.id).await?;
                self.store
                    .enqueue_action(&NewAction::download(&object.id, PRIORITY_INTERACTIVE))
                    .await?;
                eprintln!(
                    "[orchardd] delete of {} cancelled: remote changed, restoring",
                    object.id
                );
                Ok(())
            }
            DeleteResolution::Surface => {
                self.store
                    .set_sync_state(&object.id, SyncState::Conflict)
                    .await?;
                Ok(())
            }
        }
    }

    async fn parent_cloud_id(&self, object: &ObjectRecord) -> Result<String, EngineError> {
        let parent_id = object
            .parent_id
            .as_deref()
            .ok_or_else(|| EngineError::MissingObject(object.id.clone()))?;
        let parent = self.require_object(parent_id).await?;
        parent.cloud_id.ok_or_else(|| {
            EngineError::NotReady(format!("parent folder {parent_id} is not on the remote yet"))
        })
    }

    /// The token echoed as `if_match`: the shadow's ETag when we have one,
    /// the object's last known ETag otherwise.
    async fn current_if_match(&self, object: &ObjectRecord) -> Result<Option<String>, EngineError> {
        let shadow = self.store.get_shadow(&object.id).await?;
        Ok(shadow
            .and_then(|s| s.etag)
            .or_else(|| object.etag.clone()))
    }
}
