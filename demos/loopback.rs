//! Transfer a file between two in-process sessions, demonstrating the
//! byte-pump interface. The "wire" is a pair of byte vectors.

extern crate clap;
extern crate qxfer;

use clap::{App, Arg};
use qxfer::{Config, FileRecord, Protocol, Session, TransferState};

fn main() {
    let matches = App::new("qxfer loopback demo")
        .arg(Arg::with_name("file").required(true).index(1))
        .arg(Arg::with_name("outdir").required(true).index(2))
        .arg(
            Arg::with_name("protocol")
                .long("protocol")
                .takes_value(true)
                .possible_values(&["kermit", "zmodem"])
                .default_value("zmodem"),
        )
        .get_matches();

    let protocol = match matches.value_of("protocol").unwrap() {
        "kermit" => Protocol::Kermit,
        _ => Protocol::Zmodem,
    };
    let file = matches.value_of("file").unwrap();
    let outdir = matches.value_of("outdir").unwrap();

    let record = FileRecord::from_path(file).expect("cannot stat input file");
    let mut sender =
        Session::start_send(protocol, vec![record], Config::default()).expect("sender");
    let mut receiver =
        Session::start_receive(protocol, outdir, Config::default()).expect("receiver");

    let mut to_sender: Vec<u8> = Vec::new();
    let mut wire_bytes = 0usize;
    loop {
        let mut to_receiver = Vec::new();
        sender.process(&to_sender, &mut to_receiver, 65536);
        wire_bytes += to_receiver.len();

        let mut back = Vec::new();
        receiver.process(&to_receiver, &mut back, 65536);
        wire_bytes += back.len();
        to_sender = back;

        let done = |s: &Session| {
            matches!(
                s.stats().state,
                TransferState::End | TransferState::Abort
            )
        };
        if done(&sender) && done(&receiver) {
            break;
        }
    }

    let stats = receiver.stats();
    println!(
        "{}: {} -> {}/{} ({} bytes, {} on the wire, {} errors)",
        stats.protocol_name,
        file,
        outdir,
        stats.filename,
        stats.bytes_transfer,
        wire_bytes,
        stats.error_count,
    );
}
