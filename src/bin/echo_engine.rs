//! Reference engine for exercising the harness
//!
//! Speaks the engine side of the replay protocol without any game logic:
//! signals readiness on the `--pipe` descriptor, accepts both players, answers
//! each identity with the player's roster position, then echoes every frame
//! back to its sender with the type byte shifted by the seed and the
//! assigned player index prepended to the payload.
//!
//! Flags beyond the regular engine ones make it misbehave on purpose:
//!   --silent=true        never answer frames
//!   --greet=true         send an unprompted frame right after the handshake
//!   --swap-indices=true  assign index 1 to the first roster entry
//!   --exit-early=true    exit without signalling readiness
//!   --mute-handshake=true  accept both players but never answer them
//!   --handshake-index=N  answer every handshake with index N
//!   --framing=length-prefixed

use replay_harness::roster::decode_roster;
use replay_harness::wire::{FrameReader, Framing};
use std::fs::File;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::os::fd::FromRawFd;
use std::thread;
use std::time::Duration;

struct Options {
    players: String,
    port: u16,
    seed: i64,
    pipe: Option<i32>,
    framing: Framing,
    silent: bool,
    greet: bool,
    swap_indices: bool,
    exit_early: bool,
    mute_handshake: bool,
    handshake_index: Option<u8>,
}

fn flag<'a>(args: &'a [String], name: &str) -> Option<&'a str> {
    let prefix = format!("--{name}=");
    args.iter().rev().find_map(|arg| arg.strip_prefix(prefix.as_str()))
}

fn parse_options() -> Options {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let enabled = |name: &str| flag(&args, name) == Some("true");
    Options {
        players: flag(&args, "players").expect("--players is required").to_string(),
        port: flag(&args, "port")
            .and_then(|p| p.parse().ok())
            .expect("--port is required"),
        seed: flag(&args, "seed").and_then(|s| s.parse().ok()).unwrap_or(0),
        pipe: flag(&args, "pipe").and_then(|p| p.parse().ok()),
        framing: match flag(&args, "framing") {
            Some("length-prefixed") => Framing::LengthPrefixed,
            _ => Framing::default(),
        },
        silent: enabled("silent"),
        greet: enabled("greet"),
        swap_indices: enabled("swap-indices"),
        exit_early: enabled("exit-early"),
        mute_handshake: enabled("mute-handshake"),
        handshake_index: flag(&args, "handshake-index").and_then(|i| i.parse().ok()),
    }
}

fn main() {
    let options = parse_options();
    if options.exit_early {
        std::process::exit(3);
    }

    let roster = decode_roster(&options.players).expect("invalid --players");
    let listener = TcpListener::bind(("127.0.0.1", options.port)).expect("failed to bind port");

    if let Some(fd) = options.pipe {
        // SAFETY: the harness hands us the write end of its ready pipe.
        let mut pipe = unsafe { File::from_raw_fd(fd) };
        pipe.write_all(&[1]).expect("failed to signal readiness");
    }

    let mut streams = Vec::new();
    for _ in 0..roster.len() {
        let (stream, _) = listener.accept().expect("accept failed");
        streams.push(stream);
    }

    if options.mute_handshake {
        thread::sleep(Duration::from_secs(60));
        return;
    }

    let ids: Vec<&str> = roster.iter().map(|p| p.id.as_str()).collect();
    let mut workers = Vec::new();
    for mut stream in streams {
        let position = read_identity(&mut stream, &ids).expect("unknown identity");
        let index = if let Some(forced) = options.handshake_index {
            forced
        } else if options.swap_indices {
            (roster.len() - 1 - position) as u8
        } else {
            position as u8
        };

        let mut answer = vec![index];
        if options.greet {
            answer.extend(options.framing.encode(0, b"hello").expect("greeting fits a frame"));
        }
        stream.write_all(&answer).expect("handshake write failed");

        let framing = options.framing.clone();
        let shift = options.seed as u8;
        let silent = options.silent;
        workers.push(thread::spawn(move || echo(stream, framing, index, shift, silent)));
    }

    for worker in workers {
        let _ = worker.join();
    }
}

/// Read bytes until they spell one of the roster ids; returns its position
fn read_identity(stream: &mut TcpStream, ids: &[&str]) -> Option<usize> {
    let longest = ids.iter().map(|id| id.len()).max().unwrap_or(0);
    let mut received = Vec::new();
    let mut byte = [0u8; 1];
    while received.len() < longest {
        if stream.read(&mut byte).ok()? == 0 {
            return None;
        }
        received.push(byte[0]);
        if let Some(position) = ids.iter().position(|id| id.as_bytes() == received.as_slice()) {
            return Some(position);
        }
    }
    None
}

fn echo(stream: TcpStream, framing: Framing, index: u8, shift: u8, silent: bool) {
    let mut writer = stream.try_clone().expect("clone failed");
    let mut reader = FrameReader::new(stream, framing.clone());
    while let Ok(Some(frame)) = reader.read_frame() {
        if silent {
            continue;
        }
        let mut payload = Vec::with_capacity(frame.payload.len() + 1);
        payload.push(index);
        payload.extend_from_slice(&frame.payload);
        let Ok(reply) = framing.encode(frame.packet_type.wrapping_add(shift), &payload) else {
            break;
        };
        if writer.write_all(&reply).is_err() {
            break;
        }
    }
}
