// src/io/worker.rs
//
// Connection workers. Each worker owns one Modbus context (TCP or RTU) and
// loops on the set/poll channels, preferring writes over reads. Requests
// are retried with errno-driven recovery; data-address failures trigger a
// binary-search probe that isolates the offending registers so later
// batches route around them. Results go to the response channel.

use std::sync::{Arc, Mutex};

use tokio::time::{sleep, timeout, Duration};
use tokio_modbus::client::{rtu, tcp, Context, Reader, Writer};
use tokio_modbus::prelude::*;
use tokio_serial::SerialPortBuilderExt;

use crate::config::model::{Cfg, RegisterType, Transport};

use super::{now_s, IoChannels, IoWork, WorkType, WORK_BUF_LEN};

// ============================================================================
// Error codes
// ============================================================================

// libmodbus-compatible exception codes.
pub const ERR_ILLEGAL_FUNCTION: i32 = 112_345_679;
pub const ERR_BAD_DATA_ADDRESS: i32 = 112_345_680;
pub const ERR_ILLEGAL_DATA_VALUE: i32 = 112_345_681;
/// "please flush" family: the connection needs its buffers cleared.
pub const ERR_FLUSH: i32 = 112_345_691;

pub const ERR_BAD_FD: i32 = 9;
pub const ERR_NOT_SOCK: i32 = 88;
pub const ERR_TIMEOUT: i32 = 110;
pub const ERR_IN_PROGRESS: i32 = 115;
/// Catch-all for errors with no os errno.
pub const ERR_GENERIC: i32 = 1;

/// Initial connection attempts and spacing.
const CONNECT_ATTEMPTS: u32 = 5;
const CONNECT_RETRY_DELAY: Duration = Duration::from_millis(200);
/// Backoff before retrying after a transient error.
const IO_RETRY_DELAY: Duration = Duration::from_millis(200);

// ============================================================================
// Worker statistics
// ============================================================================

#[derive(Clone, Debug, Default)]
pub struct WorkerStats {
    pub jobs: u64,
    pub fails: u64,
    pub connect_time: f64,
    pub connected: bool,
}

pub type SharedWorkerStats = Arc<Mutex<WorkerStats>>;

// ============================================================================
// Worker
// ============================================================================

pub struct Worker {
    pub id: usize,
    cfg: Arc<Cfg>,
    channels: IoChannels,
    stats: SharedWorkerStats,
    ctx: Option<Context>,
}

/// How a failed operation should be handled.
enum Recovery {
    /// Wait briefly and retry on the same context.
    RetryAfterDelay,
    /// Tear the context down, reconnect, retry.
    Reconnect,
    /// Plain retry, counted against max_io_tries.
    Retry,
    /// Do not retry this range.
    Terminal,
}

fn classify(errno: i32) -> Recovery {
    match errno {
        ERR_BAD_FD | ERR_TIMEOUT => Recovery::RetryAfterDelay,
        ERR_NOT_SOCK | ERR_IN_PROGRESS | ERR_FLUSH => Recovery::Reconnect,
        ERR_BAD_DATA_ADDRESS | ERR_ILLEGAL_DATA_VALUE | ERR_ILLEGAL_FUNCTION => Recovery::Terminal,
        _ => Recovery::Retry,
    }
}

fn errno_of_exception(exc: ExceptionCode) -> i32 {
    match exc {
        ExceptionCode::IllegalFunction => ERR_ILLEGAL_FUNCTION,
        ExceptionCode::IllegalDataAddress => ERR_BAD_DATA_ADDRESS,
        ExceptionCode::IllegalDataValue => ERR_ILLEGAL_DATA_VALUE,
        _ => ERR_GENERIC,
    }
}

fn errno_of_io(err: &std::io::Error) -> i32 {
    match err.raw_os_error() {
        Some(code) => code,
        None => match err.kind() {
            std::io::ErrorKind::TimedOut => ERR_TIMEOUT,
            std::io::ErrorKind::NotConnected | std::io::ErrorKind::BrokenPipe => ERR_NOT_SOCK,
            _ => ERR_GENERIC,
        },
    }
}

/// Extract an errno from whatever error the transport returns by walking
/// the source chain down to an io error carrying a real os errno; an io
/// error kind is the fallback when no os errno appears anywhere.
fn errno_of_err<E: std::error::Error + 'static>(err: &E) -> i32 {
    let mut current: Option<&(dyn std::error::Error + 'static)> = Some(err);
    let mut fallback = ERR_GENERIC;
    while let Some(e) = current {
        if let Some(io_err) = e.downcast_ref::<std::io::Error>() {
            if io_err.raw_os_error().is_some() {
                return errno_of_io(io_err);
            }
            let from_kind = errno_of_io(io_err);
            if from_kind != ERR_GENERIC {
                fallback = from_kind;
            }
        }
        current = e.source();
    }
    fallback
}

impl Worker {
    pub fn new(id: usize, cfg: Arc<Cfg>, channels: IoChannels, stats: SharedWorkerStats) -> Self {
        Self {
            id,
            cfg,
            channels,
            stats,
            ctx: None,
        }
    }

    // ------------------------------------------------------------------
    // Connection management
    // ------------------------------------------------------------------

    async fn connect(&mut self) -> Result<(), std::io::Error> {
        let t0 = now_s();
        let slave = Slave(self.cfg.connection.device_id);
        let ctx = match &self.cfg.connection.transport {
            Transport::Tcp { host, port } => {
                let addr = match format!("{}:{}", host, port).parse() {
                    Ok(addr) => addr,
                    Err(_) => tokio::net::lookup_host((host.as_str(), *port))
                        .await?
                        .next()
                        .ok_or_else(|| {
                            std::io::Error::new(
                                std::io::ErrorKind::NotFound,
                                format!("no address for {}", host),
                            )
                        })?,
                };
                tcp::connect_slave(addr, slave).await?
            }
            Transport::Rtu {
                device,
                baud_rate,
                parity,
                data_bits,
                stop_bits,
            } => {
                let parity = match parity {
                    'E' => tokio_serial::Parity::Even,
                    'O' => tokio_serial::Parity::Odd,
                    _ => tokio_serial::Parity::None,
                };
                let data_bits = match data_bits {
                    5 => tokio_serial::DataBits::Five,
                    6 => tokio_serial::DataBits::Six,
                    7 => tokio_serial::DataBits::Seven,
                    _ => tokio_serial::DataBits::Eight,
                };
                let stop_bits = match stop_bits {
                    2 => tokio_serial::StopBits::Two,
                    _ => tokio_serial::StopBits::One,
                };
                let stream = tokio_serial::new(device, *baud_rate)
                    .parity(parity)
                    .data_bits(data_bits)
                    .stop_bits(stop_bits)
                    .open_native_async()
                    .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
                rtu::attach_slave(stream, slave)
            }
        };

        let elapsed = now_s() - t0;
        self.ctx = Some(ctx);
        if let Ok(mut stats) = self.stats.lock() {
            stats.connect_time = elapsed;
            stats.connected = true;
        }
        tlog!(
            "[Worker:{}] Connected to {} in {:.1} ms",
            self.id,
            self.cfg.connection.transport.describe(),
            elapsed * 1000.0
        );
        Ok(())
    }

    fn drop_context(&mut self) {
        self.ctx = None;
        if let Ok(mut stats) = self.stats.lock() {
            stats.connected = false;
        }
    }

    async fn ensure_connected(&mut self) -> bool {
        if self.ctx.is_some() {
            return true;
        }
        match self.connect().await {
            Ok(()) => true,
            Err(e) => {
                tlog!(
                    "[Worker:{}] Reconnect to {} failed: {}",
                    self.id,
                    self.cfg.connection.transport.describe(),
                    e
                );
                false
            }
        }
    }

    // ------------------------------------------------------------------
    // Main loop
    // ------------------------------------------------------------------

    pub async fn run(mut self) {
        // Initial connection, retried a few times; on failure the worker
        // still enters the loop and reconnects on demand.
        for attempt in 1..=CONNECT_ATTEMPTS {
            match self.connect().await {
                Ok(()) => break,
                Err(e) => {
                    tlog!(
                        "[Worker:{}] Connect attempt {}/{} failed: {}",
                        self.id,
                        attempt,
                        CONNECT_ATTEMPTS,
                        e
                    );
                    sleep(CONNECT_RETRY_DELAY).await;
                }
            }
        }

        loop {
            if self.channels.stopped() {
                break;
            }

            // Prefer pending writes over reads.
            let work = {
                let mut set_rx = self.channels.set_rx.lock().await;
                set_rx.try_recv().ok()
            }
            .or_else(|| {
                self.channels
                    .poll_rx
                    .try_lock()
                    .ok()
                    .and_then(|mut rx| rx.try_recv().ok())
            });

            match work {
                Some(work) => {
                    let work = self.execute(work).await;
                    if self.channels.response_tx.send(work).await.is_err() {
                        break;
                    }
                }
                None => sleep(Duration::from_millis(100)).await,
            }
        }

        tlog!("[Worker:{}] Stopped", self.id);
    }

    // ------------------------------------------------------------------
    // Request execution
    // ------------------------------------------------------------------

    async fn execute(&mut self, mut work: Box<IoWork>) -> Box<IoWork> {
        work.t_start = now_s();
        work.errno_code = 0;

        if work.wtype == WorkType::Noop {
            work.t_done = now_s();
            return work;
        }

        if work.local {
            self.execute_local(&mut work);
            work.t_done = now_s();
            if let Ok(mut stats) = self.stats.lock() {
                stats.jobs += 1;
            }
            return work;
        }

        let max_tries = self.cfg.connection.max_io_tries.max(1);
        loop {
            if self.channels.stopped() {
                work.errno_code = ERR_TIMEOUT;
                break;
            }
            if !self.ensure_connected().await {
                work.errors += 1;
                if work.errors >= max_tries {
                    work.errno_code = ERR_NOT_SOCK;
                    break;
                }
                sleep(IO_RETRY_DELAY).await;
                continue;
            }

            work.t_io = now_s();
            let errno = self.run_wire_op(&mut work).await;
            work.t_run = now_s() - work.t_io;

            if errno == 0 {
                work.errno_code = 0;
                break;
            }

            work.errno_code = errno;
            match classify(errno) {
                Recovery::Terminal => {
                    self.handle_terminal(&mut work).await;
                    break;
                }
                Recovery::RetryAfterDelay => {
                    work.errors += 1;
                    if work.errors >= max_tries {
                        break;
                    }
                    sleep(IO_RETRY_DELAY).await;
                }
                Recovery::Reconnect => {
                    work.errors += 1;
                    self.drop_context();
                    if work.errors >= max_tries {
                        break;
                    }
                }
                Recovery::Retry => {
                    work.errors += 1;
                    if work.errors >= max_tries {
                        break;
                    }
                }
            }
        }

        work.t_done = now_s();
        if let Ok(mut stats) = self.stats.lock() {
            stats.jobs += 1;
            if work.errno_code != 0 {
                stats.fails += 1;
            }
            work.connect_time = stats.connect_time;
        }
        work
    }

    /// Copy between the point caches and the work buffers without touching
    /// the wire. Supports the heartbeat shadow mode and replyto-only reads
    /// of cached state.
    fn execute_local(&mut self, work: &mut IoWork) {
        for &pid in &work.points {
            let point = self.cfg.point(pid);
            let idx = (point.offset - work.offset) as usize;
            if let Ok(mut rt) = point.runtime.lock() {
                if work.wtype.is_set() {
                    if point.reg_type.is_bit_type() {
                        rt.cache[0] = work.buf8[idx] as u16;
                    } else {
                        rt.cache[..point.size as usize]
                            .copy_from_slice(&work.buf16[idx..idx + point.size as usize]);
                    }
                    rt.set_time = now_s();
                } else if point.reg_type.is_bit_type() {
                    work.buf8[idx] = rt.cache[0] as u8;
                } else {
                    work.buf16[idx..idx + point.size as usize]
                        .copy_from_slice(&rt.cache[..point.size as usize]);
                }
            }
        }
    }

    /// One wire operation. Returns 0 on success or an errno code.
    async fn run_wire_op(&mut self, work: &mut IoWork) -> i32 {
        {
            let ctx = match self.ctx.as_mut() {
                Some(ctx) => ctx,
                None => return ERR_NOT_SOCK,
            };
            ctx.set_slave(Slave(work.device_id));
        }

        match work.wtype {
            WorkType::Get | WorkType::GetMulti => {
                if work.reg_type.is_bit_type() {
                    self.read_bits_into(work).await
                } else {
                    self.read_registers_into(work).await
                }
            }
            WorkType::BitGet | WorkType::BitGetMulti => self.read_bits_into(work).await,
            WorkType::Set | WorkType::SetMulti => self.write_registers_op(work).await,
            WorkType::BitSet | WorkType::BitSetMulti => self.write_bits_op(work).await,
            WorkType::Noop => 0,
        }
    }

    fn op_timeout(&self) -> Duration {
        Duration::from_millis(self.cfg.connection.connection_timeout_ms.max(1))
    }

    async fn read_registers_into(&mut self, work: &mut IoWork) -> i32 {
        let op_timeout = self.op_timeout();
        let ctx = match self.ctx.as_mut() {
            Some(ctx) => ctx,
            None => return ERR_NOT_SOCK,
        };
        let addr = work.wire_offset();
        let count = work.num_registers;

        let result = match work.reg_type {
            RegisterType::Input => {
                timeout(op_timeout, ctx.read_input_registers(addr, count)).await
            }
            _ => timeout(op_timeout, ctx.read_holding_registers(addr, count)).await,
        };
        match result {
            Err(_) => ERR_TIMEOUT,
            Ok(Err(e)) => errno_of_err(&e),
            Ok(Ok(Err(exc))) => errno_of_exception(exc),
            Ok(Ok(Ok(data))) => {
                work.buf16[..data.len().min(WORK_BUF_LEN)]
                    .copy_from_slice(&data[..data.len().min(WORK_BUF_LEN)]);
                0
            }
        }
    }

    async fn read_bits_into(&mut self, work: &mut IoWork) -> i32 {
        let op_timeout = self.op_timeout();
        let ctx = match self.ctx.as_mut() {
            Some(ctx) => ctx,
            None => return ERR_NOT_SOCK,
        };
        let addr = work.wire_offset();
        let count = work.num_registers;

        let result = match work.reg_type {
            RegisterType::DiscreteInput => {
                timeout(op_timeout, ctx.read_discrete_inputs(addr, count)).await
            }
            _ => timeout(op_timeout, ctx.read_coils(addr, count)).await,
        };
        match result {
            Err(_) => ERR_TIMEOUT,
            Ok(Err(e)) => errno_of_err(&e),
            Ok(Ok(Err(exc))) => errno_of_exception(exc),
            Ok(Ok(Ok(bits))) => {
                for (i, bit) in bits.iter().enumerate().take(WORK_BUF_LEN) {
                    work.buf8[i] = *bit as u8;
                }
                0
            }
        }
    }

    async fn write_bits_op(&mut self, work: &mut IoWork) -> i32 {
        let op_timeout = self.op_timeout();
        let ctx = match self.ctx.as_mut() {
            Some(ctx) => ctx,
            None => return ERR_NOT_SOCK,
        };
        let addr = work.wire_offset();
        let count = work.num_registers;

        if count > 1 {
            let coils: Vec<bool> = work.buf8[..count as usize].iter().map(|&b| b != 0).collect();
            match timeout(op_timeout, ctx.write_multiple_coils(addr, &coils)).await {
                Err(_) => ERR_TIMEOUT,
                Ok(Err(e)) => errno_of_err(&e),
                Ok(Ok(Err(exc))) => errno_of_exception(exc),
                Ok(Ok(Ok(()))) => 0,
            }
        } else {
            match timeout(op_timeout, ctx.write_single_coil(addr, work.buf8[0] != 0)).await {
                Err(_) => ERR_TIMEOUT,
                Ok(Err(e)) => errno_of_err(&e),
                Ok(Ok(Err(exc))) => errno_of_exception(exc),
                Ok(Ok(Ok(()))) => 0,
            }
        }
    }

    /// Register writes. A bulk write that fails decomposes into one write
    /// per contained point before giving up.
    async fn write_registers_op(&mut self, work: &mut IoWork) -> i32 {
        let count = work.num_registers;
        let addr = work.wire_offset();

        // Multi-register path first when allowed.
        if count > 1 {
            let errno = self
                .write_registers_range(addr, work, 0, count as usize)
                .await;
            if errno == 0 {
                return 0;
            }
            // Decompose: one write per point.
            if work.points.len() > 1 {
                tlog!(
                    "[Worker:{}] Bulk write at {} failed ({}), retrying per point",
                    self.id,
                    work.offset,
                    errno
                );
                let spans: Vec<(u16, u8)> = work
                    .points
                    .iter()
                    .map(|&pid| {
                        let p = self.cfg.point(pid);
                        (p.offset, p.size)
                    })
                    .collect();
                let mut last_errno = 0;
                for (p_offset, p_size) in spans {
                    let idx = (p_offset - work.offset) as usize;
                    let wire = if work.off_by_one {
                        p_offset.saturating_sub(1)
                    } else {
                        p_offset
                    };
                    let e = self
                        .write_registers_range(wire, work, idx, p_size as usize)
                        .await;
                    if e != 0 {
                        last_errno = e;
                    }
                }
                return last_errno;
            }
            return errno;
        }

        // Single register: honor the per-point opcode hint.
        let use_multi = work
            .points
            .first()
            .map(|&pid| self.cfg.point(pid).multi_write_op_code)
            .unwrap_or(false);
        if use_multi {
            self.write_registers_range(addr, work, 0, 1).await
        } else {
            let ctx = match self.ctx.as_mut() {
                Some(ctx) => ctx,
                None => return ERR_NOT_SOCK,
            };
            let op_timeout =
                Duration::from_millis(self.cfg.connection.connection_timeout_ms.max(1));
            match timeout(op_timeout, ctx.write_single_register(addr, work.buf16[0])).await {
                Err(_) => ERR_TIMEOUT,
                Ok(Err(e)) => errno_of_err(&e),
                Ok(Ok(Err(exc))) => errno_of_exception(exc),
                Ok(Ok(Ok(()))) => 0,
            }
        }
    }

    async fn write_registers_range(
        &mut self,
        wire_addr: u16,
        work: &IoWork,
        buf_at: usize,
        len: usize,
    ) -> i32 {
        let ctx = match self.ctx.as_mut() {
            Some(ctx) => ctx,
            None => return ERR_NOT_SOCK,
        };
        let op_timeout = Duration::from_millis(self.cfg.connection.connection_timeout_ms.max(1));
        let data = &work.buf16[buf_at..buf_at + len];
        match timeout(op_timeout, ctx.write_multiple_registers(wire_addr, data)).await {
            Err(_) => ERR_TIMEOUT,
            Ok(Err(e)) => errno_of_err(&e),
            Ok(Ok(Err(exc))) => errno_of_exception(exc),
            Ok(Ok(Ok(()))) => 0,
        }
    }

    // ------------------------------------------------------------------
    // Terminal failures: bad-register discovery and auto-disable
    // ------------------------------------------------------------------

    async fn handle_terminal(&mut self, work: &mut Box<IoWork>) {
        if work.errno_code != ERR_BAD_DATA_ADDRESS || work.wtype.is_set() {
            return;
        }

        let bad = self.discover_bad_regs(work).await;
        if bad.is_empty() {
            return;
        }
        tlog!(
            "[Worker:{}] Bad registers at {:?} in {}..{}",
            self.id,
            bad,
            work.offset,
            work.offset + work.num_registers
        );
        work.disabled_registers.extend(bad.iter().copied());

        if let Some(gid) = work.group {
            let group = self.cfg.group(gid);
            if let Ok(mut rt) = group.runtime.lock() {
                for &off in &bad {
                    if !rt.bad_regs.contains(&off) {
                        rt.bad_regs.push(off);
                    }
                }
            }
            if self.cfg.connection.auto_disable {
                for &off in &bad {
                    if let Some(pid) = group.point_at(off, &self.cfg.points) {
                        let point = self.cfg.point(pid);
                        if let Ok(mut rt) = point.runtime.lock() {
                            if rt.is_enabled {
                                rt.is_enabled = false;
                                tlog!(
                                    "[Worker:{}] Auto-disabled io_point '{}'",
                                    self.id,
                                    point.id
                                );
                            }
                        }
                    }
                }
            }
        }
    }

    /// Binary-search the failed range for the offsets the device rejects.
    /// Probes are single reads; already-known bad offsets are skipped.
    async fn discover_bad_regs(&mut self, work: &IoWork) -> Vec<u16> {
        let known: Vec<u16> = work
            .group
            .map(|gid| {
                self.cfg
                    .group(gid)
                    .runtime
                    .lock()
                    .map(|r| r.bad_regs.clone())
                    .unwrap_or_default()
            })
            .unwrap_or_default();

        let mut bad = Vec::new();
        let mut stack: Vec<(u16, u16)> = vec![(work.offset, work.num_registers)];
        while let Some((start, count)) = stack.pop() {
            if count == 0 {
                continue;
            }
            if count == 1 {
                if known.contains(&start) {
                    continue;
                }
                if self.probe_range(work, start, 1).await != 0 {
                    bad.push(start);
                }
                continue;
            }
            if self.probe_range(work, start, count).await == 0 {
                continue;
            }
            let half = count / 2;
            stack.push((start, half));
            stack.push((start + half, count - half));
        }
        bad.sort_unstable();
        bad
    }

    async fn probe_range(&mut self, work: &IoWork, start: u16, count: u16) -> i32 {
        let ctx = match self.ctx.as_mut() {
            Some(ctx) => ctx,
            None => return ERR_NOT_SOCK,
        };
        let op_timeout = Duration::from_millis(self.cfg.connection.connection_timeout_ms.max(1));
        let wire = if work.off_by_one {
            start.saturating_sub(1)
        } else {
            start
        };
        let result = match work.reg_type {
            RegisterType::Holding => {
                match timeout(op_timeout, ctx.read_holding_registers(wire, count)).await {
                    Err(_) => ERR_TIMEOUT,
                    Ok(Err(e)) => errno_of_err(&e),
                    Ok(Ok(Err(exc))) => errno_of_exception(exc),
                    Ok(Ok(Ok(_))) => 0,
                }
            }
            RegisterType::Input => {
                match timeout(op_timeout, ctx.read_input_registers(wire, count)).await {
                    Err(_) => ERR_TIMEOUT,
                    Ok(Err(e)) => errno_of_err(&e),
                    Ok(Ok(Err(exc))) => errno_of_exception(exc),
                    Ok(Ok(Ok(_))) => 0,
                }
            }
            RegisterType::Coil => match timeout(op_timeout, ctx.read_coils(wire, count)).await {
                Err(_) => ERR_TIMEOUT,
                Ok(Err(e)) => errno_of_err(&e),
                Ok(Ok(Err(exc))) => errno_of_exception(exc),
                Ok(Ok(Ok(_))) => 0,
            },
            RegisterType::DiscreteInput => {
                match timeout(op_timeout, ctx.read_discrete_inputs(wire, count)).await {
                    Err(_) => ERR_TIMEOUT,
                    Ok(Err(e)) => errno_of_err(&e),
                    Ok(Ok(Err(exc))) => errno_of_exception(exc),
                    Ok(Ok(Ok(_))) => 0,
                }
            }
        };
        result
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_recovery() {
        assert!(matches!(classify(ERR_BAD_FD), Recovery::RetryAfterDelay));
        assert!(matches!(classify(ERR_TIMEOUT), Recovery::RetryAfterDelay));
        assert!(matches!(classify(ERR_NOT_SOCK), Recovery::Reconnect));
        assert!(matches!(classify(ERR_IN_PROGRESS), Recovery::Reconnect));
        assert!(matches!(classify(ERR_FLUSH), Recovery::Reconnect));
        assert!(matches!(classify(ERR_BAD_DATA_ADDRESS), Recovery::Terminal));
        assert!(matches!(classify(ERR_ILLEGAL_DATA_VALUE), Recovery::Terminal));
        assert!(matches!(classify(12345), Recovery::Retry));
    }

    #[test]
    fn test_exception_errno_mapping() {
        assert_eq!(
            errno_of_exception(ExceptionCode::IllegalDataAddress),
            ERR_BAD_DATA_ADDRESS
        );
        assert_eq!(
            errno_of_exception(ExceptionCode::IllegalDataValue),
            ERR_ILLEGAL_DATA_VALUE
        );
        assert_eq!(
            errno_of_exception(ExceptionCode::IllegalFunction),
            ERR_ILLEGAL_FUNCTION
        );
    }

    #[test]
    fn test_io_errno_mapping() {
        let err = std::io::Error::from_raw_os_error(110);
        assert_eq!(errno_of_io(&err), 110);
        let err = std::io::Error::new(std::io::ErrorKind::TimedOut, "t");
        assert_eq!(errno_of_io(&err), ERR_TIMEOUT);
        let err = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "b");
        assert_eq!(errno_of_io(&err), ERR_NOT_SOCK);
    }

    #[test]
    fn test_errno_of_err_walks_source_chain() {
        let bare = std::io::Error::from_raw_os_error(88);
        assert_eq!(errno_of_err(&bare), 88);

        // wrapped one level deep, as transport error types do
        let wrapped = std::io::Error::new(
            std::io::ErrorKind::Other,
            std::io::Error::from_raw_os_error(115),
        );
        assert_eq!(errno_of_err(&wrapped), 115);
    }
}
