use std::{
    fs,
    io::{self, BufRead, BufReader, Read},
    path::PathBuf,
    thread::{self, JoinHandle},
};

use crossbeam::channel::{Receiver, Sender};
use xz2::read::XzDecoder;

/// A classified memory reference from a trace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reference {
    /// Instruction fetch, routed to the I-cache.
    Fetch(u32),
    /// Data read, routed to the D-cache.
    Load(u32),
    /// Data write, routed to the D-cache. No write semantics are
    /// modeled; it costs the same as a load.
    Store(u32),
}

/// Streaming trace reader. Lines are parsed on a background thread and
/// handed over in blocks so the simulation loop never stalls on IO.
/// Traces with an `.xz` extension are decompressed on the fly.
pub struct Trace {
    pub rec: Receiver<Vec<Reference>>,
    _thread: JoinHandle<()>,
}

impl Trace {
    pub fn open(path: PathBuf, refs_per_block: usize, blocks_per_queue: usize) -> io::Result<Trace> {
        let file = fs::File::open(&path)?;
        let stream: Box<dyn Read + Send> = if path.extension().is_some_and(|ext| ext == "xz") {
            Box::new(XzDecoder::new(file))
        } else {
            Box::new(file)
        };
        let (sender, receiver) = crossbeam::channel::bounded(blocks_per_queue);

        let t = thread::spawn(move || Trace::run_thread(stream, refs_per_block, sender));

        Ok(Trace {
            rec: receiver,
            _thread: t,
        })
    }

    fn run_thread(stream: Box<dyn Read + Send>, refs_per_block: usize, queue: Sender<Vec<Reference>>) {
        let mut lines = BufReader::new(stream).lines();
        loop {
            let mut block = Vec::with_capacity(refs_per_block);
            while block.len() < refs_per_block {
                match lines.next() {
                    Some(Ok(line)) => {
                        let line = line.trim();
                        if line.is_empty() || line.starts_with('#') {
                            continue;
                        }
                        match parse_line(line) {
                            Some(reference) => block.push(reference),
                            None => log::warn!("skipping malformed trace line {line:?}"),
                        }
                    }
                    Some(Err(err)) => {
                        log::error!("trace read failed: {err}");
                        return;
                    }
                    None => {
                        if !block.is_empty() {
                            let _ = queue.send(block);
                        }
                        return;
                    }
                }
            }
            if queue.send(block).is_err() {
                return;
            }
        }
    }
}

/// Parse one pre-trimmed, non-comment trace line of the form
/// `<i|l|s> <hex address>`.
fn parse_line(line: &str) -> Option<Reference> {
    let (kind, rest) = line.split_once(char::is_whitespace)?;
    let digits = rest.trim();
    let digits = digits
        .strip_prefix("0x")
        .or_else(|| digits.strip_prefix("0X"))
        .unwrap_or(digits);
    let addr = u32::from_str_radix(digits, 16).ok()?;
    match kind {
        "i" | "I" => Some(Reference::Fetch(addr)),
        "l" | "L" => Some(Reference::Load(addr)),
        "s" | "S" => Some(Reference::Store(addr)),
        _ => None,
    }
}
