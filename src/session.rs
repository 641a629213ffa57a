//! Session bootstrap: engine subprocess, ready pipe and player connections
//!
//! A `Session` owns everything one replay run acquires. Dropping it closes both
//! player connections and kills the engine if it is still running, so every
//! exit path of a run releases the port and the process.

use crate::config::HarnessConfig;
use crate::logger::HarnessLogger;
use crate::replay::Replay;
use crate::roster::{PlayerIdentity, PLAYER_COUNT};
use crate::wire::{handshake, Frame, FrameReader, Framing};
use crate::{HarnessError, Result};
use std::fs::File;
use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::process::CommandExt;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};

/// One-shot pipe the engine uses to announce that it is listening
///
/// Both ends are close-on-exec; only the engine child clears the flag on the
/// write end, so no other process keeps it open. Once the harness has dropped
/// its own copy, a read returning EOF means the engine exited without
/// signalling.
pub struct ReadyPipe {
    read_end: File,
    write_end: Option<OwnedFd>,
}

impl ReadyPipe {
    pub fn new() -> io::Result<Self> {
        let mut fds: [libc::c_int; 2] = [0; 2];
        create_cloexec_pipe(&mut fds)?;
        // SAFETY: both descriptors were just returned by pipe(2) and are owned
        // by nothing else.
        let (read_end, write_end) =
            unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };
        Ok(ReadyPipe {
            read_end: File::from(read_end),
            write_end: Some(write_end),
        })
    }

    /// Descriptor number the engine sees for the write end
    pub fn child_handle(&self) -> Option<RawFd> {
        self.write_end.as_ref().map(|fd| fd.as_raw_fd())
    }

    /// Let `command`'s child inherit the write end
    pub fn inherit_into(&self, command: &mut Command) {
        let Some(fd) = self.child_handle() else {
            return;
        };
        // SAFETY: the closure only calls fcntl(2), which is async-signal-safe.
        unsafe {
            command.pre_exec(move || {
                let flags = libc::fcntl(fd, libc::F_GETFD);
                if flags < 0 || libc::fcntl(fd, libc::F_SETFD, flags & !libc::FD_CLOEXEC) < 0 {
                    return Err(io::Error::last_os_error());
                }
                Ok(())
            });
        }
    }

    /// Drop the harness's copy of the write end
    pub fn close_write_end(&mut self) {
        self.write_end = None;
    }

    /// Block until the engine writes its ready byte
    ///
    /// Returns `false` if the pipe reached EOF first.
    pub fn wait_ready(&mut self) -> io::Result<bool> {
        let mut byte = [0u8; 1];
        loop {
            match self.read_end.read(&mut byte) {
                Ok(0) => return Ok(false),
                Ok(_) => return Ok(true),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(target_os = "linux")]
fn create_cloexec_pipe(fds: &mut [libc::c_int; 2]) -> io::Result<()> {
    // SAFETY: fds points to two writable c_ints.
    if unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn create_cloexec_pipe(fds: &mut [libc::c_int; 2]) -> io::Result<()> {
    // SAFETY: fds points to two writable c_ints; fcntl only touches the
    // descriptors pipe(2) just created.
    unsafe {
        if libc::pipe(fds.as_mut_ptr()) < 0 {
            return Err(io::Error::last_os_error());
        }
        for fd in fds.iter() {
            if libc::fcntl(*fd, libc::F_SETFD, libc::FD_CLOEXEC) < 0 {
                let err = io::Error::last_os_error();
                libc::close(fds[0]);
                libc::close(fds[1]);
                return Err(err);
            }
        }
    }
    Ok(())
}

/// Running engine-under-test; killed and reaped on drop
pub struct EngineProcess {
    child: Child,
}

impl EngineProcess {
    /// Build the engine command line, optionally wrapped in the profiler
    ///
    /// The engine runs inside its own directory. A relative engine path is
    /// resolved against the harness's working directory first, since the
    /// program path would otherwise be looked up after the directory change.
    pub fn command(config: &HarnessConfig, arguments: &[String]) -> io::Result<Command> {
        let engine_path = if config.engine_path.is_absolute() {
            config.engine_path.clone()
        } else {
            std::env::current_dir()?.join(&config.engine_path)
        };
        let mut command = match &config.profiler {
            Some(profiler) => {
                let mut command = Command::new(&profiler.program);
                command.args(&profiler.args).arg(&engine_path);
                command
            }
            None => Command::new(&engine_path),
        };
        command.args(arguments).stdin(Stdio::null());
        if let Some(dir) = engine_path.parent() {
            command.current_dir(dir);
        }
        Ok(command)
    }

    pub fn spawn(mut command: Command) -> io::Result<Self> {
        Ok(EngineProcess {
            child: command.spawn()?,
        })
    }

    pub fn id(&self) -> u32 {
        self.child.id()
    }

    /// Exit status if the engine has already exited
    pub fn exit_status(&mut self) -> Option<ExitStatus> {
        self.child.try_wait().ok().flatten()
    }

    /// Reap the engine if it already exited, otherwise kill it
    pub fn terminate(&mut self) -> io::Result<ExitStatus> {
        if let Some(status) = self.child.try_wait()? {
            return Ok(status);
        }
        match self.child.kill() {
            Ok(()) => {}
            // Exited between try_wait and kill
            Err(e) if e.kind() == io::ErrorKind::InvalidInput => {}
            Err(e) => return Err(e),
        }
        self.child.wait()
    }
}

impl Drop for EngineProcess {
    fn drop(&mut self) {
        let _ = self.terminate();
    }
}

/// Outcome of waiting for one inbound frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Received {
    Frame(Frame),
    TimedOut,
    Closed,
}

/// Handshake-verified connection for one player
pub struct PlayerConnection {
    stream: TcpStream,
    reader: FrameReader<TcpStream>,
}

impl PlayerConnection {
    pub fn new(stream: TcpStream, framing: Framing) -> io::Result<Self> {
        let reader = FrameReader::new(stream.try_clone()?, framing);
        Ok(PlayerConnection { stream, reader })
    }

    /// True if the engine sent anything that has not been consumed yet
    pub fn has_unread_data(&mut self) -> io::Result<bool> {
        if !self.reader.buffered().is_empty() {
            return Ok(true);
        }
        self.stream.set_nonblocking(true)?;
        let mut probe = [0u8; 1];
        let peeked = self.stream.peek(&mut probe);
        self.stream.set_nonblocking(false)?;
        match peeked {
            Ok(n) => Ok(n > 0),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Write an encoded frame with a single call
    pub fn send(&mut self, frame: &[u8]) -> io::Result<()> {
        self.stream.write_all(frame)?;
        self.stream.flush()
    }

    /// Wait up to `timeout` for one complete frame
    pub fn receive(&mut self, timeout: Duration) -> io::Result<Received> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(frame) = self.reader.next_buffered()? {
                return Ok(Received::Frame(frame));
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(Received::TimedOut);
            }
            self.stream.set_read_timeout(Some(remaining))?;
            match self.reader.fill() {
                Ok(0) => return Ok(Received::Closed),
                Ok(_) => {}
                Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                    return Ok(Received::TimedOut)
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
    }

    fn close(&self) {
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}

/// Live engine plus one connection per player, indexed by the
/// server-assigned player index
pub struct Session {
    // Declared before `engine` so connections close before the kill
    connections: [PlayerConnection; PLAYER_COUNT],
    engine: EngineProcess,
}

impl Session {
    /// Start the engine for `replay` and complete both handshakes
    pub fn start(replay: &Replay, config: &HarnessConfig, logger: &HarnessLogger) -> Result<Self> {
        let identities = replay.identities()?;
        let port = replay.port()?;

        let mut pipe = ReadyPipe::new()?;
        let handle = pipe
            .child_handle()
            .ok_or_else(|| HarnessError::EngineStartupFailed("ready pipe already closed".to_string()))?;
        let arguments = replay.engine_arguments(&handle.to_string());
        let mut command = EngineProcess::command(config, &arguments).map_err(|e| {
            HarnessError::EngineStartupFailed(format!("could not resolve engine path: {e}"))
        })?;
        pipe.inherit_into(&mut command);

        let mut engine = EngineProcess::spawn(command).map_err(|e| {
            HarnessError::EngineStartupFailed(format!(
                "could not start {}: {e}",
                config.engine_path.display()
            ))
        })?;
        pipe.close_write_end();
        logger.verbose(&format!("Started engine (pid {}) on port {port}", engine.id()));

        match pipe.wait_ready() {
            Ok(true) => {}
            Ok(false) => {
                let status = engine.terminate().ok();
                return Err(HarnessError::EngineStartupFailed(format!(
                    "engine exited before signalling readiness ({})",
                    describe_status(status)
                )));
            }
            Err(e) => {
                return Err(HarnessError::EngineStartupFailed(format!(
                    "reading ready pipe: {e}"
                )))
            }
        }

        let connections = connect_players(&mut engine, &identities, port, config, logger)?;
        Ok(Session {
            connections,
            engine,
        })
    }

    pub fn connection(&mut self, player: u8) -> &mut PlayerConnection {
        &mut self.connections[usize::from(player)]
    }

    pub fn engine(&mut self) -> &mut EngineProcess {
        &mut self.engine
    }

    /// Close both connections and stop the engine
    pub fn finish(self) -> io::Result<ExitStatus> {
        let Session {
            connections,
            mut engine,
        } = self;
        for connection in &connections {
            connection.close();
        }
        drop(connections);
        engine.terminate()
    }
}

/// Open all connections first, then run the handshakes, so the engine can
/// accept both players before it reads any identity
fn connect_players(
    engine: &mut EngineProcess,
    identities: &[PlayerIdentity],
    port: u16,
    config: &HarnessConfig,
    logger: &HarnessLogger,
) -> Result<[PlayerConnection; PLAYER_COUNT]> {
    let mut streams = Vec::with_capacity(identities.len());
    for identity in identities {
        let stream = TcpStream::connect(("localhost", port)).map_err(|e| {
            HarnessError::HandshakeFailed(format!(
                "could not connect {} to port {port}: {e}",
                identity.name
            ))
        })?;
        stream.set_nodelay(true)?;
        streams.push(stream);
    }

    let mut slots: [Option<PlayerConnection>; PLAYER_COUNT] = [None, None];
    for (identity, mut stream) in identities.iter().zip(streams) {
        stream.set_read_timeout(Some(config.handshake_timeout))?;
        let index = handshake(&mut stream, &identity.id).map_err(|e| {
            let reason = match engine.exit_status() {
                Some(status) => format!("engine exited ({status})"),
                None => e.to_string(),
            };
            HarnessError::HandshakeFailed(format!("no player index for {}: {reason}", identity.name))
        })?;
        stream.set_read_timeout(None)?;

        let slot = slots.get_mut(usize::from(index)).ok_or_else(|| {
            HarnessError::HandshakeFailed(format!(
                "engine assigned invalid index {index} to {}",
                identity.name
            ))
        })?;
        if slot.is_some() {
            return Err(HarnessError::HandshakeFailed(format!(
                "engine assigned index {index} twice"
            )));
        }
        logger.verbose(&format!("{} ({}) is player {index}", identity.name, identity.id));
        *slot = Some(PlayerConnection::new(stream, config.framing.clone())?);
    }

    match slots {
        [Some(first), Some(second)] => Ok([first, second]),
        _ => Err(HarnessError::HandshakeFailed(
            "not every player received an index".to_string(),
        )),
    }
}

fn describe_status(status: Option<ExitStatus>) -> String {
    match status {
        Some(status) => status.to_string(),
        None => "unknown status".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProfilerCommand;
    use std::net::TcpListener;

    fn connected_pair() -> (PlayerConnection, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();
        (PlayerConnection::new(client, Framing::default()).unwrap(), server)
    }

    #[test]
    fn test_receive_frame() {
        let (mut connection, mut server) = connected_pair();
        server.write_all(&Framing::default().encode(5, b"hi").unwrap()).unwrap();

        let received = connection.receive(Duration::from_secs(5)).unwrap();
        assert_eq!(received, Received::Frame(Frame::new(5, b"hi".to_vec())));
    }

    #[test]
    fn test_receive_times_out() {
        let (mut connection, _server) = connected_pair();
        let received = connection.receive(Duration::from_millis(50)).unwrap();
        assert_eq!(received, Received::TimedOut);
    }

    #[test]
    fn test_receive_closed() {
        let (mut connection, server) = connected_pair();
        drop(server);
        let received = connection.receive(Duration::from_secs(5)).unwrap();
        assert_eq!(received, Received::Closed);
    }

    #[test]
    fn test_unread_data_detection() {
        let (mut connection, mut server) = connected_pair();
        assert!(!connection.has_unread_data().unwrap());

        server.write_all(&[1]).unwrap();
        let start = Instant::now();
        while !connection.has_unread_data().unwrap() {
            assert!(start.elapsed() < Duration::from_secs(5));
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_buffered_surplus_counts_as_unread() {
        let (mut connection, mut server) = connected_pair();
        let framing = Framing::default();
        let mut bytes = framing.encode(1, b"a").unwrap();
        bytes.extend(framing.encode(2, b"b").unwrap());
        server.write_all(&bytes).unwrap();

        let first = connection.receive(Duration::from_secs(5)).unwrap();
        assert_eq!(first, Received::Frame(Frame::new(1, b"a".to_vec())));
        // Both frames may already sit in the reader's buffer
        assert!(connection.has_unread_data().unwrap());
    }

    #[test]
    fn test_ready_pipe_eof_when_child_exits() {
        let mut pipe = ReadyPipe::new().unwrap();
        let mut command = Command::new("true");
        pipe.inherit_into(&mut command);
        let mut engine = EngineProcess::spawn(command).unwrap();
        pipe.close_write_end();

        assert!(!pipe.wait_ready().unwrap());
        assert!(engine.terminate().unwrap().success());
    }

    #[test]
    fn test_ready_pipe_signalled_by_child() {
        let mut pipe = ReadyPipe::new().unwrap();
        let fd = pipe.child_handle().unwrap();
        let mut command = Command::new("bash");
        command.arg("-c").arg(format!("printf x >&{fd}; sleep 30"));
        pipe.inherit_into(&mut command);
        let mut engine = EngineProcess::spawn(command).unwrap();
        pipe.close_write_end();

        assert!(pipe.wait_ready().unwrap());
        let status = engine.terminate().unwrap();
        assert!(!status.success());
    }

    #[test]
    fn test_drop_kills_engine() {
        let mut command = Command::new("sleep");
        command.arg("30");
        let engine = EngineProcess::spawn(command).unwrap();
        let pid = engine.id() as libc::pid_t;
        drop(engine);
        // SAFETY: signal 0 only checks for existence of the (reaped) pid.
        let alive = unsafe { libc::kill(pid, 0) } == 0;
        assert!(!alive);
    }

    #[test]
    fn test_profiler_wraps_command() {
        let mut config = HarnessConfig::new("/opt/engine/core");
        config.profiler = Some(ProfilerCommand::default());
        let command = EngineProcess::command(&config, &["--port=1".to_string()]).unwrap();

        assert_eq!(command.get_program(), "perf");
        let args: Vec<_> = command.get_args().map(|a| a.to_string_lossy().into_owned()).collect();
        assert_eq!(args, vec!["record", "-g", "--", "/opt/engine/core", "--port=1"]);
        assert_eq!(command.get_current_dir(), Some(std::path::Path::new("/opt/engine")));
    }

    #[test]
    fn test_relative_engine_path_resolved_before_chdir() {
        let cwd = std::env::current_dir().unwrap();
        let config = HarnessConfig::new("build/engine");
        let command = EngineProcess::command(&config, &[]).unwrap();
        assert_eq!(command.get_program(), cwd.join("build/engine").as_os_str());
        assert_eq!(command.get_current_dir(), Some(cwd.join("build").as_path()));

        let mut profiled = HarnessConfig::new("engine");
        profiled.profiler = Some(ProfilerCommand::default());
        let command = EngineProcess::command(&profiled, &[]).unwrap();
        let args: Vec<_> = command.get_args().collect();
        assert_eq!(args[3], cwd.join("engine").as_os_str());
        assert_eq!(command.get_current_dir(), Some(cwd.as_path()));
    }
}
