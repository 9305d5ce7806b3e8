//! End-to-end Kermit transfers, pumping two sessions back to back
//! through the byte-pump interface.

#[macro_use]
extern crate lazy_static;

use qxfer::{Config, FileRecord, Protocol, Session, TransferState};
use std::fs;
use std::io::Write;
use std::path::Path;
use tempfile::tempdir;

const OUTPUT_MAX: usize = 65536;

lazy_static! {
    static ref RND_VALUES: Vec<u8> = {
        use rand::Rng;
        let mut rng = rand::thread_rng();
        let mut buf = vec![0u8; 256 * 1024];
        rng.fill(&mut buf[..]);
        buf
    };
}

fn write_source(dir: &Path, name: &str, contents: &[u8]) -> FileRecord {
    let path = dir.join(name);
    let mut f = fs::File::create(&path).unwrap();
    f.write_all(contents).unwrap();
    drop(f);
    FileRecord::from_path(path).unwrap()
}

fn finished(session: &Session) -> bool {
    matches!(
        session.stats().state,
        TransferState::End | TransferState::Abort
    )
}

/// Pump the two sessions against each other until both finish. The
/// tamper hook may mutate (or drop parts of) the sender's output.
fn pump<F>(sender: &mut Session, receiver: &mut Session, mut tamper: F)
where
    F: FnMut(&mut Vec<u8>, u64, u64),
{
    let mut to_sender: Vec<u8> = Vec::new();
    let mut rounds = 0;
    loop {
        rounds += 1;
        assert!(rounds < 50_000, "transfer did not converge");

        let mut to_receiver = Vec::new();
        sender.process(&to_sender, &mut to_receiver, OUTPUT_MAX);
        to_sender.clear();
        tamper(
            &mut to_receiver,
            sender.stats().bytes_transfer,
            sender.stats().bytes_total,
        );

        let mut back = Vec::new();
        receiver.process(&to_receiver, &mut back, OUTPUT_MAX);
        to_sender = back;

        if finished(sender) && finished(receiver) {
            break;
        }
    }
}

/// Split a Kermit byte stream on the MARK (SOH) byte. Encoded packet
/// data is all printable, so SOH only ever starts a packet.
fn split_packets(stream: &[u8]) -> Vec<Vec<u8>> {
    let mut packets: Vec<Vec<u8>> = Vec::new();
    for &b in stream {
        if b == 0x01 || packets.is_empty() {
            packets.push(Vec::new());
        }
        packets.last_mut().unwrap().push(b);
    }
    packets
}

fn run_transfer(contents: &[u8], config: Config) -> Vec<u8> {
    let updir = tempdir().unwrap();
    let downdir = tempdir().unwrap();
    let record = write_source(updir.path(), "payload.bin", contents);

    let mut sender = Session::start_send(Protocol::Kermit, vec![record], config.clone()).unwrap();
    let mut receiver =
        Session::start_receive(Protocol::Kermit, downdir.path(), config).unwrap();

    pump(&mut sender, &mut receiver, |_, _, _| {});

    assert_eq!(sender.stats().state, TransferState::End);
    assert_eq!(receiver.stats().state, TransferState::End);
    fs::read(downdir.path().join("payload.bin")).unwrap()
}

#[test]
fn streaming_transfer_is_bit_exact() {
    let received = run_transfer(&RND_VALUES[..64 * 1024], Config::default());
    assert_eq!(received, &RND_VALUES[..64 * 1024]);
}

#[test]
fn short_packet_transfer() {
    let config = Config {
        kermit_streaming: false,
        kermit_long_packets: false,
        ..Config::default()
    };
    let received = run_transfer(&RND_VALUES[..16 * 1024], config);
    assert_eq!(received, &RND_VALUES[..16 * 1024]);
}

#[test]
fn windowed_transfer() {
    let config = Config {
        kermit_streaming: false,
        ..Config::default()
    };
    let received = run_transfer(&RND_VALUES[..32 * 1024], config);
    assert_eq!(received, &RND_VALUES[..32 * 1024]);
}

#[test]
fn empty_file_transfer() {
    let received = run_transfer(&[], Config::default());
    assert_eq!(received, b"");
}

#[test]
fn windowed_transfer_survives_dropped_data_packets() {
    // Sliding windows recover lost Data packets through NAKs alone.
    for k in [2usize, 3, 5, 10] {
        let config = Config {
            kermit_streaming: false,
            ..Config::default()
        };
        let updir = tempdir().unwrap();
        let downdir = tempdir().unwrap();
        let contents = &RND_VALUES[..48 * 1024];
        let record = write_source(updir.path(), "lossy.bin", contents);

        let mut sender =
            Session::start_send(Protocol::Kermit, vec![record], config.clone()).unwrap();
        let mut receiver =
            Session::start_receive(Protocol::Kermit, downdir.path(), config).unwrap();

        let mut data_count = 0usize;
        pump(&mut sender, &mut receiver, |out, transferred, total| {
            let packets = split_packets(out);
            let mut kept = Vec::new();
            for packet in packets {
                let is_data = packet.len() > 3 && packet[0] == 0x01 && packet[3] == b'D';
                if is_data {
                    data_count += 1;
                    // Drop the kth Data packet, but never so close to
                    // the end that only timeouts could recover it.
                    if data_count % k == 0 && total.saturating_sub(transferred) > 8192 {
                        continue;
                    }
                }
                kept.extend_from_slice(&packet);
            }
            *out = kept;
        });

        assert_eq!(sender.stats().state, TransferState::End, "k = {}", k);
        assert_eq!(receiver.stats().state, TransferState::End, "k = {}", k);
        let received = fs::read(downdir.path().join("lossy.bin")).unwrap();
        assert_eq!(received, contents, "k = {}", k);
        assert!(receiver.stats().error_count > 0, "k = {}", k);
    }
}

#[test]
fn uppercase_names_fold_to_lowercase() {
    let updir = tempdir().unwrap();
    let downdir = tempdir().unwrap();
    let record = write_source(updir.path(), "REPORT.TXT", b"all caps name");

    let mut sender =
        Session::start_send(Protocol::Kermit, vec![record], Config::default()).unwrap();
    let mut receiver =
        Session::start_receive(Protocol::Kermit, downdir.path(), Config::default()).unwrap();
    pump(&mut sender, &mut receiver, |_, _, _| {});

    assert_eq!(
        fs::read(downdir.path().join("report.txt")).unwrap(),
        b"all caps name"
    );
}

#[test]
fn batch_of_three_files() {
    let updir = tempdir().unwrap();
    let downdir = tempdir().unwrap();
    let records = vec![
        write_source(updir.path(), "one.bin", &RND_VALUES[..1000]),
        write_source(updir.path(), "two.bin", &RND_VALUES[1000..1024]),
        write_source(updir.path(), "three.bin", &RND_VALUES[2048..6000]),
    ];

    let mut sender = Session::start_send(Protocol::Kermit, records, Config::default()).unwrap();
    let mut receiver =
        Session::start_receive(Protocol::Kermit, downdir.path(), Config::default()).unwrap();
    pump(&mut sender, &mut receiver, |_, _, _| {});

    assert_eq!(
        fs::read(downdir.path().join("one.bin")).unwrap(),
        &RND_VALUES[..1000]
    );
    assert_eq!(
        fs::read(downdir.path().join("two.bin")).unwrap(),
        &RND_VALUES[1000..1024]
    );
    assert_eq!(
        fs::read(downdir.path().join("three.bin")).unwrap(),
        &RND_VALUES[2048..6000]
    );
    assert_eq!(
        receiver.stats().batch_bytes_total,
        sender.stats().batch_bytes_total
    );
}

#[test]
fn crash_recovery_resumes_at_existing_length() {
    // An interrupted download left 4096 bytes on disk; the RESEND
    // disposition makes the sender seek past them.
    let updir = tempdir().unwrap();
    let downdir = tempdir().unwrap();
    let contents = &RND_VALUES[..8192];
    let record = write_source(updir.path(), "resume.bin", contents);
    fs::write(downdir.path().join("resume.bin"), &contents[..4096]).unwrap();

    let mut sender =
        Session::start_send(Protocol::Kermit, vec![record], Config::default()).unwrap();
    let mut receiver =
        Session::start_receive(Protocol::Kermit, downdir.path(), Config::default()).unwrap();
    pump(&mut sender, &mut receiver, |_, _, _| {});

    assert_eq!(sender.stats().state, TransferState::End);
    let received = fs::read(downdir.path().join("resume.bin")).unwrap();
    assert_eq!(received.len(), contents.len());
    assert_eq!(received, contents);
}

#[test]
fn collision_without_resend_renames() {
    // With RESEND off, a name collision must produce file.0000 and
    // leave the original alone.
    let config = Config {
        kermit_resend: false,
        ..Config::default()
    };
    let updir = tempdir().unwrap();
    let downdir = tempdir().unwrap();
    let record = write_source(updir.path(), "taken.bin", b"new contents");
    fs::write(downdir.path().join("taken.bin"), b"old contents").unwrap();

    let mut sender =
        Session::start_send(Protocol::Kermit, vec![record], config.clone()).unwrap();
    let mut receiver =
        Session::start_receive(Protocol::Kermit, downdir.path(), config).unwrap();
    pump(&mut sender, &mut receiver, |_, _, _| {});

    assert_eq!(
        fs::read(downdir.path().join("taken.bin")).unwrap(),
        b"old contents"
    );
    assert_eq!(
        fs::read(downdir.path().join("taken.bin.0000")).unwrap(),
        b"new contents"
    );
}

#[test]
fn text_mode_strips_carriage_returns() {
    let config = Config {
        kermit_uploads_force_binary: false,
        ..Config::default()
    };
    let updir = tempdir().unwrap();
    let downdir = tempdir().unwrap();
    let record = write_source(updir.path(), "notes.txt", b"alpha\nbravo\ncharlie\n");

    let mut sender =
        Session::start_send(Protocol::Kermit, vec![record], config.clone()).unwrap();
    let mut receiver =
        Session::start_receive(Protocol::Kermit, downdir.path(), config).unwrap();
    pump(&mut sender, &mut receiver, |_, _, _| {});

    // The sender expands LF to CRLF on the wire; the receiver strips
    // the CRs back out.
    assert_eq!(
        fs::read(downdir.path().join("notes.txt")).unwrap(),
        b"alpha\nbravo\ncharlie\n"
    );
}

#[test]
fn modification_time_is_preserved() {
    let updir = tempdir().unwrap();
    let downdir = tempdir().unwrap();
    let record = write_source(updir.path(), "dated.bin", b"timestamped");

    let mut sender =
        Session::start_send(Protocol::Kermit, vec![record.clone()], Config::default()).unwrap();
    let mut receiver =
        Session::start_receive(Protocol::Kermit, downdir.path(), Config::default()).unwrap();
    pump(&mut sender, &mut receiver, |_, _, _| {});

    let received = fs::metadata(downdir.path().join("dated.bin"))
        .unwrap()
        .modified()
        .unwrap();
    let sent = record.modtime;
    // The Attributes date field has one-second resolution.
    let delta = match received.duration_since(sent) {
        Ok(d) => d,
        Err(e) => e.duration(),
    };
    assert!(delta.as_secs() <= 1, "mtime drifted by {:?}", delta);
}

#[test]
fn stop_without_save_partial_deletes_download() {
    let updir = tempdir().unwrap();
    let downdir = tempdir().unwrap();
    let record = write_source(updir.path(), "partial.bin", &RND_VALUES[..32 * 1024]);

    let mut sender =
        Session::start_send(Protocol::Kermit, vec![record], Config::default()).unwrap();
    let mut receiver =
        Session::start_receive(Protocol::Kermit, downdir.path(), Config::default()).unwrap();

    // Run a few rounds, enough for the file to be created.
    let mut to_sender: Vec<u8> = Vec::new();
    for _ in 0..8 {
        let mut to_receiver = Vec::new();
        sender.process(&to_sender, &mut to_receiver, OUTPUT_MAX);
        let mut back = Vec::new();
        receiver.process(&to_receiver, &mut back, OUTPUT_MAX);
        to_sender = back;
    }
    assert!(downdir.path().join("partial.bin").exists());

    receiver.stop(false);
    assert_eq!(receiver.stats().state, TransferState::Abort);
    assert!(!downdir.path().join("partial.bin").exists());
}
