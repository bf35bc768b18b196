use std::{
    fs, io,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result, anyhow, ensure};
use aya::programs::kprobe::KProbeLinkId;
use aya::programs::trace_point::TracePointLinkId;
use aya::programs::{KProbe, TracePoint};
use aya::{
    Ebpf, EbpfLoader, include_bytes_aligned,
    maps::{HashMap as BpfHashMap, Map, MapData},
};
use chrono::Utc;
use log::{debug, info, warn};
use serde_json::Value;
use tokio::{signal, time};

use probe_counter_common::{HOOK_POINTS, HTTP_METRICS_MAP, HookKind, HookPoint, TCP_METRICS_MAP};

use crate::metrics::{DeltaTracker, MetricsSnapshot};

const EBPF_BYTES: &[u8] = include_bytes_aligned!(concat!(env!("OUT_DIR"), "/probe-counter"));
const COUNTER_MAPS: [&str; 2] = [TCP_METRICS_MAP, HTTP_METRICS_MAP];

pub const DEFAULT_PIN_DIR: &str = "/sys/fs/bpf/probe_counter";

#[derive(Clone, Debug)]
pub struct AttachOptions {
    /// Directory the counter tables are pinned under, `None` to skip pinning.
    pub pin_dir: Option<PathBuf>,
    pub map_entries: u32,
    pub report_interval: Duration,
}

/// Loads the eBPF object, attaches every hook point and logs the counters every
/// `report_interval` until Ctrl+C, then detaches and removes the pins.
pub async fn attach_hooks(opts: AttachOptions) -> Result<()> {
    validate_attach_options(&opts)?;
    bump_memlock_rlimit();

    let mut loader = EbpfLoader::new();
    #[allow(deprecated)]
    {
        // Both tables share one size; the object's default is TABLE_CAPACITY.
        for name in COUNTER_MAPS {
            loader.set_max_entries(name, opts.map_entries);
        }
    }

    let mut bpf = loader
        .load(EBPF_BYTES)
        .context("failed to load eBPF object")?;

    let pins = match &opts.pin_dir {
        Some(dir) => pin_maps(&mut bpf, dir)?,
        None => Vec::new(),
    };

    let result = run_attached(&mut bpf, opts.report_interval).await;
    unpin_all(&pins);
    result
}

async fn run_attached(bpf: &mut Ebpf, report_interval: Duration) -> Result<()> {
    let mut links = Vec::with_capacity(HOOK_POINTS.len());
    for hook in HOOK_POINTS.iter() {
        match attach_hook(bpf, hook) {
            Ok(link) => {
                info!("attached {} ({}) -> {}", hook.name, hook.program, hook.table);
                links.push((hook, link));
            }
            Err(err) => {
                detach_all(bpf, links);
                return Err(err);
            }
        }
    }

    info!("all hook points attached. Press Ctrl+C to detach.");

    let shutdown = signal::ctrl_c();
    tokio::pin!(shutdown);
    let mut ticker = time::interval(report_interval);
    // The first tick completes immediately.
    ticker.tick().await;
    let mut tracker = DeltaTracker::default();

    let result = loop {
        tokio::select! {
            res = &mut shutdown => {
                break res.context("failed to wait for shutdown signal");
            }
            _ = ticker.tick() => report(bpf, &mut tracker),
        }
    };

    info!("detaching {} hook points...", links.len());
    detach_all(bpf, links);
    result
}

/// Reads the pinned counter tables under `pin_dir`.
pub fn read_pinned<P: AsRef<Path>>(pin_dir: P) -> Result<MetricsSnapshot> {
    let dir = pin_dir.as_ref();
    let tcp = open_pinned(&dir.join(TCP_METRICS_MAP))?;
    let http = open_pinned(&dir.join(HTTP_METRICS_MAP))?;
    MetricsSnapshot::read(&tcp, &http)
}

/// JSON rendering of [`read_pinned`], stamped with the collection time.
pub fn dump_pinned<P: AsRef<Path>>(pin_dir: P) -> Result<Value> {
    let snapshot = read_pinned(pin_dir)?;
    Ok(snapshot.to_json(Utc::now()))
}

fn open_pinned(path: &Path) -> Result<BpfHashMap<MapData, u32, u64>> {
    let map_data = MapData::from_pin(path)
        .map_err(|e| anyhow!("failed to open pinned map {}: {}", path.display(), e))?;
    let map = Map::from_map_data(map_data).map_err(|e| anyhow!("invalid map type: {}", e))?;
    BpfHashMap::<_, u32, u64>::try_from(map)
        .map_err(|e| anyhow!("failed to convert {} to HashMap: {}", path.display(), e))
}

fn validate_attach_options(opts: &AttachOptions) -> Result<()> {
    ensure!(opts.map_entries > 0, "map size must be greater than zero");
    ensure!(
        !opts.report_interval.is_zero(),
        "report interval must be greater than zero"
    );
    Ok(())
}

// Older kernels account BPF memory against RLIMIT_MEMLOCK.
fn bump_memlock_rlimit() {
    let rlim = libc::rlimit {
        rlim_cur: libc::RLIM_INFINITY,
        rlim_max: libc::RLIM_INFINITY,
    };
    let ret = unsafe { libc::setrlimit(libc::RLIMIT_MEMLOCK, &rlim) };
    if ret != 0 {
        debug!("remove limit on locked memory failed, ret is: {ret}");
    }
}

/// Pins every counter table under `dir`, replacing pins an earlier run left
/// behind. Returns the pin paths so they can be removed at detach.
fn pin_maps(bpf: &mut Ebpf, dir: &Path) -> Result<Vec<PathBuf>> {
    fs::create_dir_all(dir).with_context(|| format!("failed to create {}", dir.display()))?;

    let mut pins = Vec::with_capacity(COUNTER_MAPS.len());
    for name in COUNTER_MAPS {
        let path = dir.join(name);
        if let Err(err) = pin_map(bpf, name, &path) {
            unpin_all(&pins);
            return Err(err);
        }
        pins.push(path);
    }
    info!("counter tables pinned under {}", dir.display());
    Ok(pins)
}

fn pin_map(bpf: &mut Ebpf, map_name: &str, path: &Path) -> Result<()> {
    if remove_pin(path)? {
        warn!("replaced stale pin {}", path.display());
    }
    let map = bpf
        .map_mut(map_name)
        .with_context(|| format!("map {map_name} not found"))?;
    map.pin(path)
        .map_err(|err| anyhow!("failed to pin {map_name} at {}: {err}", path.display()))
}

/// Removes the pin at `path`. Returns whether one was there.
///
/// A pin that outlives its loader points at a table no program writes anymore,
/// so it is dropped rather than reused.
fn remove_pin(path: &Path) -> Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(err) => {
            Err(err).with_context(|| format!("failed to remove pin {}", path.display()))
        }
    }
}

fn unpin_all(pins: &[PathBuf]) {
    for path in pins.iter().rev() {
        match remove_pin(path) {
            Ok(_) => debug!("unpinned {}", path.display()),
            Err(err) => warn!("{err:#}"),
        }
    }
}

fn report(bpf: &Ebpf, tracker: &mut DeltaTracker) {
    match read_loaded(bpf) {
        Ok(snapshot) => {
            let delta = tracker.observe(&snapshot);
            if delta.is_zero() {
                debug!("{snapshot} (unchanged)");
            } else {
                info!("{snapshot} ({delta})");
            }
        }
        Err(err) => warn!("failed to read counters: {err:#}"),
    }
}

fn read_loaded(bpf: &Ebpf) -> Result<MetricsSnapshot> {
    let tcp = loaded_map(bpf, TCP_METRICS_MAP)?;
    let http = loaded_map(bpf, HTTP_METRICS_MAP)?;
    MetricsSnapshot::read(&tcp, &http)
}

fn loaded_map<'a>(bpf: &'a Ebpf, name: &str) -> Result<BpfHashMap<&'a MapData, u32, u64>> {
    let map = bpf
        .map(name)
        .with_context(|| format!("map {name} not found"))?;
    BpfHashMap::try_from(map).with_context(|| format!("map {name} has unexpected type"))
}

enum LinkHandle {
    KProbe(KProbeLinkId),
    TracePoint(TracePointLinkId),
}

fn attach_hook(bpf: &mut Ebpf, hook: &HookPoint) -> Result<LinkHandle> {
    match hook.kind {
        HookKind::KProbe { function } => {
            let program = kprobe_mut(bpf, hook)?;
            program
                .load()
                .with_context(|| format!("failed to load {}", hook.program))?;
            program
                .attach(function, 0)
                .map(LinkHandle::KProbe)
                .with_context(|| format!("failed to attach kprobe on {function}"))
        }
        HookKind::TracePoint { category, name } => {
            let program = tracepoint_mut(bpf, hook)?;
            program
                .load()
                .with_context(|| format!("failed to load {}", hook.program))?;
            program
                .attach(category, name)
                .map(LinkHandle::TracePoint)
                .with_context(|| format!("failed to attach tracepoint {category}/{name}"))
        }
    }
}

fn detach(bpf: &mut Ebpf, hook: &HookPoint, handle: LinkHandle) -> Result<()> {
    match handle {
        LinkHandle::KProbe(id) => kprobe_mut(bpf, hook)?
            .detach(id)
            .with_context(|| format!("failed to detach {}", hook.program)),
        LinkHandle::TracePoint(id) => tracepoint_mut(bpf, hook)?
            .detach(id)
            .with_context(|| format!("failed to detach {}", hook.program)),
    }
}

fn detach_all(bpf: &mut Ebpf, links: Vec<(&HookPoint, LinkHandle)>) {
    for (hook, handle) in links.into_iter().rev() {
        match detach(bpf, hook, handle) {
            Ok(()) => info!("detached {}", hook.name),
            Err(err) => warn!("{err:#}"),
        }
    }
}

fn kprobe_mut<'a>(bpf: &'a mut Ebpf, hook: &HookPoint) -> Result<&'a mut KProbe> {
    bpf.program_mut(hook.program)
        .with_context(|| format!("program {} not found", hook.program))?
        .try_into()
        .with_context(|| format!("{} is not a kprobe program", hook.program))
}

fn tracepoint_mut<'a>(bpf: &'a mut Ebpf, hook: &HookPoint) -> Result<&'a mut TracePoint> {
    bpf.program_mut(hook.program)
        .with_context(|| format!("program {} not found", hook.program))?
        .try_into()
        .with_context(|| format!("{} is not a tracepoint program", hook.program))
}
