#[cfg(not(feature = "fuse-mount"))]
fn main() {
    eprintln!("orchard-fuse binary requires --features fuse-mount");
    std::process::exit(1);
}

#[cfg(feature = "fuse-mount")]
mod app {
    use std::collections::HashMap;
    use std::ffi::OsStr;
    use std::path::PathBuf;
    use std::process::ExitCode;
    use std::sync::{Arc, Mutex};
    use std::time::{Duration, SystemTime, UNIX_EPOCH};

    use fuser::{
        FileAttr, FileType, Filesystem, MountOption, ReplyAttr, ReplyCreate, ReplyData,
        ReplyDirectory, ReplyEmpty, ReplyEntry, ReplyOpen, ReplyWrite, ReplyXattr, Request,
        TimeOrNow,
    };
    use libc::{EACCES, EEXIST, EIO, EISDIR, ENODATA, ENOENT, ENOSPC, ENOTDIR, ENOTEMPTY};
    use tokio::runtime::Runtime;

    use orchard_fuse::{
        Attr, BridgeError, BridgeOptions, DenyAction, DirEntry, OpenHandle, OrchardBridge,
    };
    use orchardd::cache::CacheError;
    use orchardd::config::{Config, ConfigError};
    use orchardd::daemon::DaemonRuntime;
    use orchardd::store::ObjectKind;

    const TTL: Duration = Duration::from_secs(1);
    const EXIT_CONFIG: u8 = 2;
    const EXIT_MOUNT: u8 = 3;
    const EXIT_AUTH: u8 = 4;

    struct InodeMap {
        next: u64,
        path_to_ino: HashMap<String, u64>,
        ino_to_path: HashMap<u64, String>,
    }

    impl InodeMap {
        fn new() -> Self {
            let mut path_to_ino = HashMap::new();
            let mut ino_to_path = HashMap::new();
            path_to_ino.insert("/".to_string(), 1);
            ino_to_path.insert(1, "/".to_string());
            Self {
                next: 2,
                path_to_ino,
                ino_to_path,
            }
        }

        fn inode_for(&mut self, path: &str) -> u64 {
            if let Some(existing) = self.path_to_ino.get(path) {
                return *existing;
            }
            let ino = self.next;
            self.next += 1;
            self.path_to_ino.insert(path.to_string(), ino);
            self.ino_to_path.insert(ino, path.to_string());
            ino
        }

        fn path_for(&self, ino: u64) -> Option<String> {
            self.ino_to_path.get(&ino).cloned()
        }

        fn relocate(&mut self, old_path: &str, new_path: &str) {
            if let Some(ino) = self.path_to_ino.remove(old_path) {
                self.path_to_ino.insert(new_path.to_string(), ino);
                self.ino_to_path.insert(ino, new_path.to_string());
            }
        }

        fn forget_path(&mut self, path: &str) {
            if let Some(ino) = self.path_to_ino.remove(path) {
                self.ino_to_path.remove(&ino);
            }
        }
    }

    struct OrchardFs {
        rt: Arc<Runtime>,
        bridge: Arc<OrchardBridge>,
        inodes: Mutex<InodeMap>,
        handles: Mutex<HashMap<u64, OpenHandle>>,
        next_fh: Mutex<u64>,
    }

    impl OrchardFs {
        fn new(rt: Arc<Runtime>, bridge: Arc<OrchardBridge>) -> Self {
            Self {
                rt,
                bridge,
                inodes: Mutex::new(InodeMap::new()),
                handles: Mutex::new(HashMap::new()),
                next_fh: Mutex::new(1),
            }
        }

        fn path_from_ino(&self, ino: u64) -> Option<String> {
            self.inodes.lock().ok()?.path_for(ino)
        }

        fn child_path(parent: &str, name: &OsStr) -> String {
            let name = name.to_string_lossy();
            if parent == "/" {
                format!("/{name}")
            } else {
                format!("{}/{name}", parent.trim_end_matches('/'))
            }
        }

        fn register_handle(&self, handle: OpenHandle) -> u64 {
            let mut next = self.next_fh.lock().expect("fh mutex poisoned");
            let fh = *next;
            *next += 1;
            self.handles
                .lock()
                .expect("handle mutex poisoned")
                .insert(fh, handle);
            fh
        }

        fn take_handle(&self, fh: u64) -> Option<OpenHandle> {
            self.handles
                .lock()
                .expect("handle mutex poisoned")
                .remove(&fh)
        }

        fn file_attr(&self, path: &str, attr: &Attr) -> FileAttr {
            let ino = match self.inodes.lock() {
                Ok(mut inodes) => inodes.inode_for(path),
                Err(_) => 1,
            };
            attr_for(ino, attr)
        }

        fn caller_comm(req: &Request<'_>) -> Option<String> {
            let comm = std::fs::read_to_string(format!("/proc/{}/comm", req.pid())).ok()?;
            Some(comm.trim().to_string())
        }
    }

    fn attr_for(ino: u64, attr: &Attr) -> FileAttr {
        let kind = match attr.kind {
            ObjectKind::Folder => FileType::Directory,
            ObjectKind::File => FileType::RegularFile,
        };
        let size = attr.size.max(0) as u64;
        let mtime = UNIX_EPOCH + Duration::from_secs(attr.modified_at.max(0) as u64);
        FileAttr {
            ino,
            size,
            blocks: size.div_ceil(512),
            atime: mtime,
            mtime,
            ctime: mtime,
            crtime: mtime,
            kind,
            perm: if kind == FileType::Directory { 0o755 } else { 0o644 },
            nlink: if kind == FileType::Directory { 2 } else { 1 },
            uid: unsafe { libc::geteuid() },
            gid: unsafe { libc::getegid() },
            rdev: 0,
            flags: 0,
            blksize: 512,
        }
    }

    fn errno_for(err: &BridgeError) -> i32 {
        match err {
            BridgeError::NotFound(_) => ENOENT,
            BridgeError::AlreadyExists(_) => EEXIST,
            BridgeError::NotAFolder(_) => ENOTDIR,
            BridgeError::IsAFolder(_) => EISDIR,
            BridgeError::NotEmpty(_) => ENOTEMPTY,
            BridgeError::Denied(_) => EACCES,
            BridgeError::UnsupportedXattr(_) => ENODATA,
            BridgeError::Cache(CacheError::Io(io)) if io.raw_os_error() == Some(ENOSPC) => ENOSPC,
            _ => EIO,
        }
    }

    impl Filesystem for OrchardFs {
        fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
            let Some(parent_path) = self.path_from_ino(parent) else {
                reply.error(ENOENT);
                return;
            };
            let path = Self::child_path(&parent_path, name);
            match self.rt.block_on(self.bridge.getattr(&path)) {
                Ok(attr) => reply.entry(&TTL, &self.file_attr(&path, &attr), 0),
                Err(err) => reply.error(errno_for(&err)),
            }
        }

        fn getattr(&mut self, _req: &Request<'_>, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
            let Some(path) = self.path_from_ino(ino) else {
                reply.error(ENOENT);
                return;
            };
            match self.rt.block_on(self.bridge.getattr(&path)) {
                Ok(attr) => reply.attr(&TTL, &self.file_attr(&path, &attr)),
                Err(err) => reply.error(errno_for(&err)),
            }
        }

        fn readdir(
            &mut self,
            _req: &Request<'_>,
            ino: u64,
            _fh: u64,
            offset: i64,
            mut reply: ReplyDirectory,
        ) {
            let Some(path) = self.path_from_ino(ino) else {
                reply.error(ENOENT);
                return;
            };
            let children: Vec<DirEntry> = match self.rt.block_on(self.bridge.readdir(&path)) {
                Ok(children) => children,
                Err(err) => {
                    reply.error(errno_for(&err));
                    return;
                }
            };

            let mut entries: Vec<(u64, FileType, String)> =
                vec![(ino, FileType::Directory, ".".to_string())];
            let parent_path = if path == "/" {
                "/".to_string()
            } else {
                path.rsplit_once('/')
                    .map(|(parent, _)| if parent.is_empty() { "/" } else { parent })
                    .unwrap_or("/")
                    .to_string()
            };
            let mut inodes = match self.inodes.lock() {
                Ok(inodes) => inodes,
                Err(_) => {
                    reply.error(EIO);
                    return;
                }
            };
            entries.push((inodes.inode_for(&parent_path), FileType::Directory, "..".to_string()));
            for child in children {
                let child_path = Self::child_path(&path, OsStr::new(&child.name));
                let kind = match child.kind {
                    ObjectKind::Folder => FileType::Directory,
                    ObjectKind::File => FileType::RegularFile,
                };
                entries.push((inodes.inode_for(&child_path), kind, child.name));
            }
            drop(inodes);

            for (idx, (entry_ino, entry_type, name)) in
                entries.iter().enumerate().skip(offset as usize)
            {
                if reply.add(*entry_ino, (idx + 1) as i64, *entry_type, name) {
                    break;
                }
            }
            reply.ok();
        }

        fn open(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
            let Some(path) = self.path_from_ino(ino) else {
                reply.error(ENOENT);
                return;
            };
            match self.rt.block_on(self.bridge.open(&path)) {
                Ok(handle) => reply.opened(self.register_handle(handle), 0),
                Err(err) => reply.error(errno_for(&err)),
            }
        }

        fn create(
            &mut self,
            _req: &Request<'_>,
            parent: u64,
            name: &OsStr,
            _mode: u32,
            _umask: u32,
            _flags: i32,
            reply: ReplyCreate,
        ) {
            let Some(parent_path) = self.path_from_ino(parent) else {
                reply.error(ENOENT);
                return;
            };
            let path = Self::child_path(&parent_path, name);
            match self.rt.block_on(self.bridge.create(&path)) {
                Ok(handle) => {
                    let attr = match self.rt.block_on(self.bridge.getattr(&path)) {
                        Ok(attr) => attr,
                        Err(err) => {
                            reply.error(errno_for(&err));
                            return;
                        }
                    };
                    let file_attr = self.file_attr(&path, &attr);
                    reply.created(&TTL, &file_attr, 0, self.register_handle(handle), 0);
                }
                Err(err) => reply.error(errno_for(&err)),
            }
        }

        fn read(
            &mut self,
            req: &Request<'_>,
            ino: u64,
            _fh: u64,
            offset: i64,
            size: u32,
            _flags: i32,
            _lock_owner: Option<u64>,
            reply: ReplyData,
        ) {
            let Some(path) = self.path_from_ino(ino) else {
                reply.error(ENOENT);
                return;
            };
            let comm = Self::caller_comm(req);
            match self.rt.block_on(self.bridge.read(
                &path,
                offset.max(0) as u64,
                size as usize,
                comm.as_deref(),
            )) {
                Ok(data) => reply.data(&data),
                Err(err) => reply.error(errno_for(&err)),
            }
        }

        fn write(
            &mut self,
            _req: &Request<'_>,
            ino: u64,
            _fh: u64,
            offset: i64,
            data: &[u8],
            _write_flags: u32,
            _flags: i32,
            _lock_owner: Option<u64>,
            reply: ReplyWrite,
        ) {
            let Some(path) = self.path_from_ino(ino) else {
                reply.error(ENOENT);
                return;
            };
            match self
                .rt
                .block_on(self.bridge.write(&path, offset.max(0) as u64, data))
            {
                Ok(written) => reply.written(written as u32),
                Err(err) => reply.error(errno_for(&err)),
            }
        }

        #[allow(clippy::too_many_arguments)]
        fn setattr(
            &mut self,
            _req: &Request<'_>,
            ino: u64,
            _mode: Option<u32>,
            _uid: Option<u32>,
            _gid: Option<u32>,
            size: Option<u64>,
            _atime: Option<TimeOrNow>,
            _mtime: Option<TimeOrNow>,
            _ctime: Option<SystemTime>,
            _fh: Option<u64>,
            _crtime: Option<SystemTime>,
            _chgtime: Option<SystemTime>,
            _bkuptime: Option<SystemTime>,
            _flags: Option<u32>,
            reply: ReplyAttr,
        ) {
            let Some(path) = self.path_from_ino(ino) else {
                reply.error(ENOENT);
                return;
            };
            if let Some(size) = size {
                if let Err(err) = self.rt.block_on(self.bridge.truncate(&path, size)) {
                    reply.error(errno_for(&err));
                    return;
                }
            }
            match self.rt.block_on(self.bridge.getattr(&path)) {
                Ok(attr) => reply.attr(&TTL, &self.file_attr(&path, &attr)),
                Err(err) => reply.error(errno_for(&err)),
            }
        }

        fn release(
            &mut self,
            _req: &Request<'_>,
            _ino: u64,
            fh: u64,
            _flags: i32,
            _lock_owner: Option<u64>,
            _flush: bool,
            reply: ReplyEmpty,
        ) {
            if let Some(handle) = self.take_handle(fh) {
                if let Err(err) = self.rt.block_on(self.bridge.release(&handle)) {
                    eprintln!("[orchard-fuse] release error: {err}");
                }
            }
            reply.ok();
        }

        fn mkdir(
            &mut self,
            _req: &Request<'_>,
            parent: u64,
            name: &OsStr,
            _mode: u32,
            _umask: u32,
            reply: ReplyEntry,
        ) {
            let Some(parent_path) = self.path_from_ino(parent) else {
                reply.error(ENOENT);
                return;
            };
            let path = Self::child_path(&parent_path, name);
            if let Err(err) = self.rt.block_on(self.bridge.mkdir(&path)) {
                reply.error(errno_for(&err));
                return;
            }
            match self.rt.block_on(self.bridge.getattr(&path)) {
                Ok(attr) => reply.entry(&TTL, &self.file_attr(&path, &attr), 0),
                Err(err) => reply.error(errno_for(&err)),
            }
        }

        fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
            let Some(parent_path) = self.path_from_ino(parent) else {
                reply.error(ENOENT);
                return;
            };
            let path = Self::child_path(&parent_path, name);
            match self.rt.block_on(self.bridge.unlink(&path)) {
                Ok(()) => {
                    if let Ok(mut inodes) = self.inodes.lock() {
                        inodes.forget_path(&path);
                    }
                    reply.ok();
                }
                Err(err) => reply.error(errno_for(&err)),
            }
        }

        fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
            let Some(parent_path) = self.path_from_ino(parent) else {
                reply.error(ENOENT);
                return;
            };
            let path = Self::child_path(&parent_path, name);
            match self.rt.block_on(self.bridge.rmdir(&path)) {
                Ok(()) => {
                    if let Ok(mut inodes) = self.inodes.lock() {
                        inodes.forget_path(&path);
                    }
                    reply.ok();
                }
                Err(err) => reply.error(errno_for(&err)),
            }
        }

        fn rename(
            &mut self,
            _req: &Request<'_>,
            parent: u64,
            name: &OsStr,
            newparent: u64,
            newname: &OsStr,
            _flags: u32,
            reply: ReplyEmpty,
        ) {
            let (Some(parent_path), Some(new_parent_path)) =
                (self.path_from_ino(parent), self.path_from_ino(newparent))
            else {
                reply.error(ENOENT);
                return;
            };
            let old_path = Self::child_path(&parent_path, name);
            let new_path = Self::child_path(&new_parent_path, newname);
            match self.rt.block_on(self.bridge.rename(&old_path, &new_path)) {
                Ok(()) => {
                    if let Ok(mut inodes) = self.inodes.lock() {
                        inodes.relocate(&old_path, &new_path);
                    }
                    reply.ok();
                }
                Err(err) => reply.error(errno_for(&err)),
            }
        }

        fn getxattr(
            &mut self,
            _req: &Request<'_>,
            ino: u64,
            name: &OsStr,
            size: u32,
            reply: ReplyXattr,
        ) {
            let Some(path) = self.path_from_ino(ino) else {
                reply.error(ENOENT);
                return;
            };
            let name = name.to_string_lossy();
            match self.rt.block_on(self.bridge.getxattr(&path, &name)) {
                Ok(value) => {
                    if size == 0 {
                        reply.size(value.len() as u32);
                    } else if (value.len() as u32) <= size {
                        reply.data(&value);
                    } else {
                        reply.error(libc::ERANGE);
                    }
                }
                Err(err) => reply.error(errno_for(&err)),
            }
        }

        fn setxattr(
            &mut self,
            _req: &Request<'_>,
            ino: u64,
            name: &OsStr,
            value: &[u8],
            _flags: i32,
            _position: u32,
            reply: ReplyEmpty,
        ) {
            let Some(path) = self.path_from_ino(ino) else {
                reply.error(ENOENT);
                return;
            };
            let name = name.to_string_lossy();
            match self.rt.block_on(self.bridge.setxattr(&path, &name, value)) {
                Ok(()) => reply.ok(),
                Err(err) => reply.error(errno_for(&err)),
            }
        }
    }

    /// The mount target must be empty (or freshly created); anything else
    /// is refused so we never shadow user data.
    fn check_mount_point(mount_point: &PathBuf) -> Result<(), std::io::Error> {
        if !mount_point.exists() {
            std::fs::create_dir_all(mount_point)?;
            return Ok(());
        }
        let mut entries = std::fs::read_dir(mount_point)?;
        if entries.next().is_some() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::AlreadyExists,
                format!(
                    "mount point {} is not empty and not an Orchard mount",
                    mount_point.display()
                ),
            ));
        }
        Ok(())
    }

    pub fn run() -> ExitCode {
        let config_path = match parse_config_arg() {
            Ok(path) => path,
            Err(err) => {
                eprintln!("[orchard-fuse] {err}");
                return ExitCode::from(EXIT_CONFIG);
            }
        };
        let config = match Config::load(config_path.as_deref()) {
            Ok(config) => config,
            Err(err) => {
                eprintln!("[orchard-fuse] config error: {err}");
                return ExitCode::from(EXIT_CONFIG);
            }
        };
        let mount_point = config.mount_point.clone();
        if let Err(err) = check_mount_point(&mount_point) {
            eprintln!("[orchard-fuse] mount error: {err}");
            return ExitCode::from(EXIT_MOUNT);
        }

        let rt = match Runtime::new() {
            Ok(rt) => Arc::new(rt),
            Err(err) => {
                eprintln!("[orchard-fuse] runtime error: {err}");
                return ExitCode::from(1);
            }
        };

        // Supervisor order: store first, then workers, then the mount.
        // Teardown runs in reverse: the session unmounts before the
        // background tasks stop and the store closes.
        let daemon = match rt.block_on(DaemonRuntime::bootstrap(config.clone())) {
            Ok(daemon) => daemon,
            Err(err) => {
                eprintln!("[orchard-fuse] startup error: {err:#}");
                let code = match err.downcast_ref::<ConfigError>() {
                    Some(ConfigError::MissingToken) => EXIT_AUTH,
                    Some(_) => EXIT_CONFIG,
                    None => 1,
                };
                return ExitCode::from(code);
            }
        };
        let background = {
            let _guard = rt.enter();
            daemon.start_background()
        };

        let bridge = Arc::new(OrchardBridge::new(
            daemon.store().clone(),
            daemon.cache().clone(),
            BridgeOptions {
                thumbnailer_denylist: config.thumbnailer_denylist.clone(),
                deny_action: DenyAction::ZeroFill,
                chunk_read_timeout: Duration::from_millis(config.chunk_read_timeout_ms),
            },
        ));

        let fs = OrchardFs::new(Arc::clone(&rt), bridge);
        let options = vec![
            MountOption::FSName("orchard".to_string()),
            MountOption::DefaultPermissions,
            MountOption::AutoUnmount,
        ];
        eprintln!("[orchard-fuse] mounting at {}", mount_point.display());
        let mount_result = fuser::mount2(fs, &mount_point, &options);

        rt.block_on(background.shutdown());
        match mount_result {
            Ok(()) => ExitCode::SUCCESS,
            Err(err) => {
                eprintln!("[orchard-fuse] mount error: {err}");
                ExitCode::from(EXIT_MOUNT)
            }
        }
    }

    fn parse_config_arg() -> anyhow::Result<Option<PathBuf>> {
        let mut config = None;
        let mut args = std::env::args().skip(1);
        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--config" => {
                    let value = args
                        .next()
                        .ok_or_else(|| anyhow::anyhow!("--config requires a path"))?;
                    config = Some(PathBuf::from(value));
                }
                other => anyhow::bail!("unknown argument: {other}"),
            }
        }
        Ok(config)
    }
}

#[cfg(feature = "fuse-mount")]
fn main() -> std::process::ExitCode {
    app::run()
}
