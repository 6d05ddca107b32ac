//! Shared fixtures for the integration tests.
//!
//! [`FakeRuntime`] implements [`OciRuntime`] with plain host processes: `create`
//! spawns `/bin/sh` gated on a file in the bundle, `start` creates that file,
//! and `state` reports `running` for as long as the process exists. Every call
//! is recorded and any step can be made to fail.

#![allow(dead_code)]

use async_trait::async_trait;
use magikbuild::cleanup::RunMountArtifacts;
use magikbuild::collaborators::{Collaborators, SshSource};
use magikbuild::mounts::run_mounts::Secret;
use magikbuild::mounts::{MountAssembler, MountContext, MountSources};
use magikbuild::namespace::{EffectiveNamespaces, IdMap, IdMappingOptions, NamespaceOptions};
use magikbuild::runtime::{CreateOptions, CreateStdio};
use magikbuild::spec::{MountEntry, default_mounts};
use magikbuild::{ContainerState, ContainerStatus, Error, OciRuntime, OciSpec, RelayEndpoints, Result, Signal};
use std::collections::{BTreeMap, HashMap};
use std::io::{Read, Write};
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Mutex;
use tempfile::TempDir;

/// Waits for the gate file named by `$1`, then becomes the container command.
const GATE_SCRIPT: &str = r#"while [ ! -e "$1" ]; do sleep 0.02; done; shift; exec "$@""#;

/// A runtime call as seen by the fake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Create(String),
    Start(String),
    State(String),
    Kill(String, Signal),
    Delete(String),
}

/// Steps a failure can be injected at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Create,
    Start,
    State,
    Delete,
}

#[derive(Debug, Default)]
pub struct FakeRuntime {
    calls: Mutex<Vec<Call>>,
    fail_at: Mutex<Vec<Step>>,
    containers: Mutex<HashMap<String, (i32, PathBuf)>>,
    specs: Mutex<Vec<OciSpec>>,
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_at(step: Step) -> Self {
        Self::failing_at_all(&[step])
    }

    pub fn failing_at_all(steps: &[Step]) -> Self {
        let runtime = Self::default();
        *runtime.fail_at.lock().unwrap() = steps.to_vec();
        runtime
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    /// Number of recorded calls matching `pred`.
    pub fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
        self.calls().iter().filter(|c| pred(c)).count()
    }

    /// Specs read from `config.json` at create time, in order.
    pub fn specs(&self) -> Vec<OciSpec> {
        self.specs.lock().unwrap().clone()
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }

    fn fails(&self, step: Step) -> bool {
        self.fail_at.lock().unwrap().contains(&step)
    }

    fn pid(&self, id: &str) -> Option<i32> {
        self.containers.lock().unwrap().get(id).map(|(pid, _)| *pid)
    }

    fn failure(command: &str, id: &str) -> Error {
        Error::runtime_exit(command, id, "exit status: 1", "")
    }
}

#[async_trait]
impl OciRuntime for FakeRuntime {
    fn name(&self) -> &str {
        "fake"
    }

    async fn create(&self, id: &str, bundle: &Path, opts: CreateOptions) -> Result<()> {
        self.record(Call::Create(id.to_string()));
        if self.fails(Step::Create) {
            if let CreateStdio::Pipes { stderr, .. } = &opts.stdio {
                let mut out = std::fs::File::from(stderr.try_clone()?);
                writeln!(out, "fake-runtime: cannot create container {id}")?;
            }
            return Err(Self::failure("create", id));
        }

        let spec = OciSpec::load(bundle)?;
        let args = spec.process.as_ref().map(|p| p.args.clone()).unwrap_or_default();
        self.specs.lock().unwrap().push(spec);

        let mut cmd = std::process::Command::new("/bin/sh");
        cmd.arg("-c")
            .arg(GATE_SCRIPT)
            .arg("fake-init")
            .arg(bundle.join("started"))
            .args(&args);
        match opts.stdio {
            CreateStdio::Pipes { stdin, stdout, stderr } => {
                cmd.stdin(Stdio::from(stdin))
                    .stdout(Stdio::from(stdout))
                    .stderr(Stdio::from(stderr));
            }
            CreateStdio::Inherit => {
                cmd.stdin(Stdio::null());
            }
        }
        let child = cmd.spawn()?;
        let pid = child.id() as i32;
        std::fs::write(&opts.pid_file, pid.to_string())?;
        self.containers
            .lock()
            .unwrap()
            .insert(id.to_string(), (pid, bundle.to_path_buf()));
        Ok(())
    }

    async fn start(&self, id: &str) -> Result<()> {
        self.record(Call::Start(id.to_string()));
        if self.fails(Step::Start) {
            return Err(Self::failure("start", id));
        }
        let bundle = self
            .containers
            .lock()
            .unwrap()
            .get(id)
            .map(|(_, b)| b.clone())
            .ok_or_else(|| Self::failure("start", id))?;
        std::fs::write(bundle.join("started"), b"")?;
        Ok(())
    }

    async fn state(&self, id: &str) -> Result<ContainerState> {
        self.record(Call::State(id.to_string()));
        if self.fails(Step::State) {
            return Err(Error::Protocol {
                id: id.to_string(),
                reason: "malformed state output".to_string(),
            });
        }
        let pid = self.pid(id).ok_or_else(|| Self::failure("state", id))?;
        // SAFETY: signal 0 only checks for existence.
        let alive = unsafe { libc::kill(pid, 0) } == 0;
        let status = if alive { ContainerStatus::Running } else { ContainerStatus::Stopped };
        let mut state = ContainerState::new(id, "", status);
        state.pid = Some(pid as u32);
        Ok(state)
    }

    async fn kill(&self, id: &str, signal: Signal) -> Result<()> {
        self.record(Call::Kill(id.to_string(), signal));
        if let Some(pid) = self.pid(id) {
            // SAFETY: plain kill(2); ESRCH after exit is fine.
            unsafe { libc::kill(pid, signal.as_i32()) };
        }
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<()> {
        self.record(Call::Delete(id.to_string()));
        self.containers.lock().unwrap().remove(id);
        if self.fails(Step::Delete) {
            return Err(Self::failure("delete", id));
        }
        Ok(())
    }
}

/// Caller-side pipes standing in for a terminal's stdio.
pub struct CallerPipes {
    stdin_r: OwnedFd,
    stdout_r: OwnedFd,
    stdout_w: Option<OwnedFd>,
    stderr_r: OwnedFd,
    stderr_w: Option<OwnedFd>,
}

impl CallerPipes {
    /// Pipes with `input` queued on stdin, followed by EOF.
    pub fn with_input(input: &[u8]) -> Self {
        let (stdin_r, stdin_w) = magikbuild::sys::pipe().unwrap();
        let mut writer = std::fs::File::from(stdin_w);
        writer.write_all(input).unwrap();
        drop(writer);
        let (stdout_r, stdout_w) = magikbuild::sys::pipe().unwrap();
        let (stderr_r, stderr_w) = magikbuild::sys::pipe().unwrap();
        Self {
            stdin_r,
            stdout_r,
            stdout_w: Some(stdout_w),
            stderr_r,
            stderr_w: Some(stderr_w),
        }
    }

    pub fn endpoints(&self) -> RelayEndpoints {
        RelayEndpoints {
            stdin: self.stdin_r.as_raw_fd(),
            stdout: self.stdout_w.as_ref().map_or(-1, |fd| fd.as_raw_fd()),
            stderr: self.stderr_w.as_ref().map_or(-1, |fd| fd.as_raw_fd()),
        }
    }

    /// Closes the write ends and returns everything relayed to stdout and
    /// stderr.
    pub fn finish(mut self) -> (String, String) {
        self.stdout_w.take();
        self.stderr_w.take();
        let mut out = String::new();
        std::fs::File::from(self.stdout_r).read_to_string(&mut out).unwrap();
        let mut err = String::new();
        std::fs::File::from(self.stderr_r).read_to_string(&mut err).unwrap();
        (out, err)
    }
}

/// A rootfs directory with the usual mount points.
pub fn rootfs(parent: &Path) -> PathBuf {
    let root = parent.join("rootfs");
    for dir in ["etc", "dev", "proc", "sys", "tmp"] {
        std::fs::create_dir_all(root.join(dir)).unwrap();
    }
    root
}

pub fn sh(script: &str) -> Vec<String> {
    vec!["/bin/sh".to_string(), "-c".to_string(), script.to_string()]
}

/// Host IDs of this process, which container root maps onto in fixtures so
/// chowns to the mapped root succeed without privileges.
pub fn self_ids() -> (u32, u32) {
    // SAFETY: geteuid/getegid have no preconditions.
    unsafe { (libc::geteuid(), libc::getegid()) }
}

pub fn self_mapping() -> IdMappingOptions {
    let (uid, gid) = self_ids();
    IdMappingOptions {
        uid_map: vec![IdMap { container_id: 0, host_id: uid, size: 1 }],
        gid_map: vec![IdMap { container_id: 0, host_id: gid, size: 1 }],
    }
}

/// Owned inputs for a [`MountContext`].
pub struct MountFixture {
    pub tmp: TempDir,
    pub rootfs: PathBuf,
    pub container_dir: PathBuf,
    pub tmp_dir: PathBuf,
    pub cache_parent: PathBuf,
    pub context_dir: PathBuf,
    pub work_dir: String,
    pub stage_mounts: BTreeMap<String, PathBuf>,
    pub secrets: BTreeMap<String, Secret>,
    pub ssh_sources: BTreeMap<String, SshSource>,
    pub id_mappings: IdMappingOptions,
    pub namespaces: EffectiveNamespaces,
    pub base_mounts: Vec<MountEntry>,
    pub collaborators: Collaborators,
}

impl MountFixture {
    pub fn new() -> Self {
        let tmp = TempDir::new().unwrap();
        let dir = |name: &str| {
            let path = tmp.path().join(name);
            std::fs::create_dir_all(&path).unwrap();
            path
        };
        let container_dir = dir("container");
        let tmp_dir = dir("tmp");
        let cache_parent = dir("cache");
        let context_dir = dir("context");
        let rootfs = rootfs(tmp.path());
        Self {
            rootfs,
            container_dir,
            tmp_dir,
            cache_parent,
            context_dir,
            work_dir: "/".to_string(),
            stage_mounts: BTreeMap::new(),
            secrets: BTreeMap::new(),
            ssh_sources: BTreeMap::new(),
            id_mappings: self_mapping(),
            namespaces: EffectiveNamespaces::fold([&NamespaceOptions::defaults()]).unwrap(),
            base_mounts: default_mounts(),
            collaborators: Collaborators::default(),
            tmp,
        }
    }

    /// Shares the cache directory of `other`, as a second run on the same
    /// host would.
    pub fn sharing_cache_with(other: &MountFixture) -> Self {
        let mut fixture = Self::new();
        fixture.cache_parent = other.cache_parent.clone();
        fixture
    }

    pub fn ctx(&self) -> MountContext<'_> {
        MountContext {
            rootfs: &self.rootfs,
            container_dir: &self.container_dir,
            tmp_dir: &self.tmp_dir,
            cache_parent: &self.cache_parent,
            work_dir: &self.work_dir,
            context_dir: Some(&self.context_dir),
            stage_mounts: &self.stage_mounts,
            secrets: &self.secrets,
            ssh_sources: &self.ssh_sources,
            id_mappings: &self.id_mappings,
            process_user: (0, 0),
            mount_label: None,
            process_label: None,
            namespaces: &self.namespaces,
            user_namespace: false,
            base_mounts: &self.base_mounts,
            shm_size: "64m",
            subscriptions_file: None,
        }
    }

    pub fn assemble(&self, sources: &MountSources, artifacts: &mut RunMountArtifacts) -> Result<Vec<MountEntry>> {
        MountAssembler::new(self.ctx(), &self.collaborators).assemble(sources, artifacts)
    }

    pub fn run_mounts(specs: &[&str]) -> MountSources {
        MountSources {
            run_mounts: specs.iter().map(|s| (*s).to_string()).collect(),
            ..Default::default()
        }
    }
}

/// Returns the mounts for `destination`.
pub fn at<'a>(mounts: &'a [MountEntry], destination: &str) -> Vec<&'a MountEntry> {
    mounts.iter().filter(|m| m.destination == destination).collect()
}

/// Sends `fds` over `socket` with `SCM_RIGHTS`, the way a runtime hands over
/// a console.
pub fn send_fds(socket: &UnixStream, name: &str, fds: &[RawFd]) -> io::Result<()> {
    let iov = libc::iovec {
        iov_base: name.as_ptr() as *mut libc::c_void,
        iov_len: name.len().max(1),
    };
    let payload = (fds.len() * size_of::<RawFd>()) as u32;
    // SAFETY: pure size computation.
    let cmsg_space = unsafe { libc::CMSG_SPACE(payload) } as usize;
    let mut cmsg_buf = vec![0u8; cmsg_space];

    // SAFETY: zeroed msghdr is a valid empty header.
    let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
    msg.msg_iov = &iov as *const _ as *mut _;
    msg.msg_iovlen = 1;
    msg.msg_control = cmsg_buf.as_mut_ptr().cast();
    msg.msg_controllen = cmsg_space as _;

    // SAFETY: the control buffer has room for one header carrying `fds`.
    unsafe {
        let cmsg = libc::CMSG_FIRSTHDR(&msg);
        if cmsg.is_null() {
            return Err(io::Error::other("CMSG_FIRSTHDR null"));
        }
        (*cmsg).cmsg_level = libc::SOL_SOCKET;
        (*cmsg).cmsg_type = libc::SCM_RIGHTS;
        (*cmsg).cmsg_len = libc::CMSG_LEN(payload) as _;
        std::ptr::copy_nonoverlapping(
            fds.as_ptr().cast::<u8>(),
            libc::CMSG_DATA(cmsg),
            fds.len() * size_of::<RawFd>(),
        );
    }

    // SAFETY: msg references live buffers.
    if unsafe { libc::sendmsg(socket.as_raw_fd(), &msg, 0) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Opens a pseudo-terminal pair as (master, slave).
pub fn openpty() -> (OwnedFd, OwnedFd) {
    let mut master = -1;
    let mut slave = -1;
    // SAFETY: openpty fills both descriptors; name, termios and winsize are optional.
    let rc = unsafe {
        libc::openpty(
            &mut master,
            &mut slave,
            std::ptr::null_mut(),
            std::ptr::null(),
            std::ptr::null(),
        )
    };
    assert_eq!(rc, 0, "openpty: {}", std::io::Error::last_os_error());
    // SAFETY: both descriptors were just opened and are owned by nobody else.
    unsafe { (OwnedFd::from_raw_fd(master), OwnedFd::from_raw_fd(slave)) }
}

/// Local-mode flags of the terminal on `fd`.
pub fn local_flags(fd: RawFd) -> libc::tcflag_t {
    // SAFETY: termios is plain data filled by tcgetattr.
    let mut attrs: libc::termios = unsafe { std::mem::zeroed() };
    // SAFETY: tcgetattr writes into `attrs`.
    assert_eq!(unsafe { libc::tcgetattr(fd, &mut attrs) }, 0);
    attrs.c_lflag
}
