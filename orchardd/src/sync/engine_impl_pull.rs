impl<R: RemoteAdapter> SyncEngine<R> {
    /// Single-level pull of a folder's remote children. Discovered
    /// subfolders get their own low-priority listing; cloud-originated
    /// children absent from the listing are tombstoned.
    async fn execute_list_children(&self, folder_id: &str) -> Result<(), EngineError> {
        let folder = self.require_object(folder_id).await?;
        let Some(folder_cloud_id) = folder.cloud_id.clone() else {
            // Not pushed yet; there is nothing remote to list.
            return Ok(());
        };

        let entries = self.remote.list(&folder_cloud_id).await?;
        let mut seen: HashSet<String> = HashSet::with_capacity(entries.len());

        for entry in &entries {
            seen.insert(entry.cloud_id.clone());
            let previous = self.store.get_object_by_cloud_id(&entry.cloud_id).await?;
            let record = self
                .store
                .apply_remote_delta(&remote_delta_for(entry, folder_id, &folder_cloud_id)?)
                .await?;

            match entry.kind {
                EntryKind::Folder => {
                    self.store
                        .enqueue_action(&NewAction::list_children(&record.id, PRIORITY_BACKGROUND))
                        .await?;
                }
                EntryKind::File => {
                    let remote_changed = previous
                        .as_ref()
                        .map(|prev| prev.etag != entry.etag)
                        .unwrap_or(false);
                    if remote_changed && !record.dirty {
                        self.store
                            .enqueue_action(&NewAction::ensure_latest(
                                &record.id,
                                PRIORITY_BACKGROUND,
                            ))
                            .await?;
                    }
                }
            }
        }

        for child in self.store.list_children(folder_id).await? {
            let Some(child_cloud_id) = &child.cloud_id else {
                continue;
            };
            if child.origin != crate::store::Origin::Cloud || seen.contains(child_cloud_id) {
                continue;
            }
            if child.dirty {
                // Local edit vs remote delete is arbitrated by ensure_latest.
                self.store.mark_missing_from_cloud(&child.id).await?;
                self.store
                    .enqueue_action(&NewAction::ensure_latest(&child.id, PRIORITY_INTERACTIVE))
                    .await?;
                continue;
            }
            self.store.mark_missing_from_cloud(&child.id).await?;
            self.store.mark_deleted(&child.id, Direction::Pull).await?;
            self.store
                .enqueue_action(&NewAction::delete(&child.id, Direction::Pull))
                .await?;
        }

        self.store.mark_listed(folder_id).await?;
        Ok(())
    }

    /// Full download for small files: metadata refresh, stream to `.part`,
    /// atomic rename, then one transaction for the store effects.
    async fn execute_download(&self, object: &ObjectRecord) -> Result<(), EngineError> {
        let cloud_id = object
            .cloud_id
            .as_deref()
            .ok_or_else(|| EngineError::MissingObject(object.id.clone()))?;
        let meta = self.remote.metadata(cloud_id).await?;

        let part = self.cache.begin_full_download(&object.id).await?;
        if let Err(err) = self
            .remote
            .download(cloud_id, Some(&meta.etag), &part)
            .await
        {
            self.cache.discard_partial(&object.id).await?;
            return Err(err.into());
        }

        let (size, hash) = self.cache.commit_full_download(&object.id).await?;
        self.store
            .apply_download_success(
                &object.id,
                Some(&meta.etag),
                meta.revision.as_deref(),
                size as i64,
                &hash,
            )
            .await?;
        Ok(())
    }

    /// HTTP range fetch of one aligned chunk. A remote version change
    /// aborts the partial materialization entirely.
    async fn execute_download_chunk(
        &self,
        object: &ObjectRecord,
        chunk_index: i64,
    ) -> Result<(), EngineError> {
        let cloud_id = object
            .cloud_id
            .as_deref()
            .ok_or_else(|| EngineError::MissingObject(object.id.clone()))?;
        let size = object.size.max(0) as u64;
        let chunk_size = self.cache.chunk_size();
        let start = chunk_index as u64 * chunk_size;
        if start >= size {
            return Ok(());
        }
        let end = (start + chunk_size).min(size) - 1;

        match self
            .remote
            .download_range(cloud_id, start, end, object.etag.as_deref())
            .await
        {
            Ok(bytes) => {
                self.cache
                    .write_chunk(&object.id, chunk_index, &bytes, size)
                    .await?;
                Ok(())
            }
            Err(RemoteError::PreconditionFailed) => {
                eprintln!(
                    "[orchardd] stale chunk fetch for {}: invalidating cached chunks",
                    object.id
                );
                self.cache.invalidate_chunks(&object.id, size).await?;
                self.store
                    .enqueue_action(&NewAction::ensure_latest(&object.id, PRIORITY_FUSE))
                    .await?;
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Metadata-only reconciliation: compares object, shadow and remote and
    /// schedules the push or pull that closes the gap.
    async fn execute_ensure_latest(&self, object: &ObjectRecord) -> Result<(), EngineError> {
        let Some(cloud_id) = object.cloud_id.as_deref() else {
            if object.dirty && !object.deleted {
                self.store
                    .enqueue_action(&NewAction::upload(&object.id))
                    .await?;
            }
            return Ok(());
        };

        let meta = match self.remote.metadata(cloud_id).await {
            Ok(meta) => meta,
            Err(RemoteError::NotFound) => {
                return self.reconcile_remote_gone(object).await;
            }
            Err(err) => return Err(err.into()),
        };

        let shadow = self.store.get_shadow(&object.id).await?;
        let baseline = shadow.as_ref().map(Baseline::from_shadow);
        let cache_hash = self
            .store
            .get_cache_entry(&object.id)
            .await?
            .and_then(|entry| entry.file_hash);
        let local = conflict::local_version_of(object, cache_hash.as_deref());
        let remote = conflict::RemoteVersion {
            etag: Some(meta.etag.clone()),
        };

        match conflict::classify(baseline.as_ref(), &local, &remote) {
            Classification::NoOp => {
                if object.sync_state != SyncState::Synced && !object.dirty && !object.deleted {
                    self.store.mark_synced_noop(&object.id).await?;
                }
                Ok(())
            }
            Classification::PushLocal | Classification::Conflict => {
                // The push handler owns conflict arbitration; its
                // precondition check will observe the same divergence.
                self.store
                    .enqueue_action(&NewAction::update_content(&object.id))
                    .await?;
                Ok(())
            }
            Classification::PullRemote => {
                self.schedule_pull(object, meta.size.unwrap_or(object.size.max(0) as u64))
                    .await
            }
        }
    }

    /// The remote object vanished: either tombstone the local projection or,
    /// for a dirty object, re-push it as a brand new cloud object.
    async fn reconcile_remote_gone(&self, object: &ObjectRecord) -> Result<(), EngineError> {
        if object.deleted {
            // Local delete already in flight; the delete handler finishes it.
            return Ok(());
        }
        self.store.mark_missing_from_cloud(&object.id).await?;
        if object.dirty {
            match conflict::resolve_delete_conflict(
                self.policy,
                DeleteConflict::LocalEditRemoteDelete,
            ) {
                DeleteResolution::RepushAsNew => {
                    self.store
                        .enqueue_action(&NewAction::upload(&object.id))
                        .await?;
                }
                DeleteResolution::RestoreRemote | DeleteResolution::Surface => {
                    self.store
                        .set_sync_state(&object.id, SyncState::Conflict)
                        .await?;
                }
            }
            return Ok(());
        }
        self.store.mark_deleted(&object.id, Direction::Pull).await?;
        self.store
            .enqueue_action(&NewAction::delete(&object.id, Direction::Pull))
            .await?;
        Ok(())
    }

    async fn schedule_pull(&self, object: &ObjectRecord, size: u64) -> Result<(), EngineError> {
        if object.kind == ObjectKind::Folder {
            self.store
                .enqueue_action(&NewAction::list_children(&object.id, PRIORITY_BACKGROUND))
                .await?;
            return Ok(());
        }
        if !object.deleted {
            self.store
                .set_sync_state(&object.id, SyncState::PendingPull)
                .await?;
        }
        if self.cache.uses_sparse(size) {
            // Partial content is stale now; drop it and let reads refetch.
            self.cache.invalidate_chunks(&object.id, size).await?;
        } else {
            self.store
                .enqueue_action(&NewAction::download(&object.id, PRIORITY_INTERACTIVE))
                .await?;
        }
        Ok(())
    }
}

fn remote_delta_for(
    entry: &RemoteEntry,
    parent_id: &str,
    parent_cloud_id: &str,
) -> Result<RemoteDelta, EngineError> {
    Ok(RemoteDelta {
        cloud_id: entry.cloud_id.clone(),
        cloud_parent_id: parent_cloud_id.to_string(),
        parent_id: parent_id.to_string(),
        name: entry.name.clone(),
        kind: entry_kind_to_object(entry.kind),
        size: entry.size.map(|v| v as i64),
        etag: entry.etag.clone(),
        revision: None,
        cloud_modified_at: parse_modified(entry.modified.as_deref())?,
    })
}
