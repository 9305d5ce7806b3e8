//! End-to-end ZMODEM transfers through the byte-pump interface,
//! including crash recovery, skip, CRC corruption and cancellation.

#[macro_use]
extern crate lazy_static;

use qxfer::{Config, FileRecord, Protocol, Session, TransferState, ZmodemFlavor};
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

fn pump<F>(sender: &mut Session, receiver: &mut Session, mut tamper: F)
where
    F: FnMut(&mut Vec<u8>),
{
    let mut to_sender: Vec<u8> = Vec::new();
    let mut rounds = 0;
    loop {
        rounds += 1;
        assert!(rounds < 50_000, "transfer did not converge");

        let mut to_receiver = Vec::new();
        sender.process(&to_sender, &mut to_receiver, OUTPUT_MAX);
        to_sender.clear();
        tamper(&mut to_receiver);

        let mut back = Vec::new();
        receiver.process(&to_receiver, &mut back, OUTPUT_MAX);
        to_sender = back;

        if finished(sender) && finished(receiver) {
            break;
        }
    }
}

fn run_transfer(name: &str, contents: &[u8], config: Config) -> (Session, Session, Vec<u8>) {
    let updir = tempdir().unwrap();
    let downdir = tempdir().unwrap();
    let record = write_source(updir.path(), name, contents);

    let mut sender = Session::start_send(Protocol::Zmodem, vec![record], config.clone()).unwrap();
    let mut receiver = Session::start_receive(Protocol::Zmodem, downdir.path(), config).unwrap();
    pump(&mut sender, &mut receiver, |_| {});

    let received = fs::read(downdir.path().join(name)).unwrap();
    (sender, receiver, received)
}

#[test]
fn crc32_transfer_is_bit_exact() {
    let (sender, receiver, received) =
        run_transfer("blob.bin", &RND_VALUES[..64 * 1024], Config::default());
    assert_eq!(sender.stats().state, TransferState::End);
    assert_eq!(receiver.stats().state, TransferState::End);
    assert_eq!(received, &RND_VALUES[..64 * 1024]);
}

#[test]
fn crc16_transfer_is_bit_exact() {
    let config = Config {
        zmodem_flavor: ZmodemFlavor::Crc16,
        ..Config::default()
    };
    let (_, receiver, received) = run_transfer("blob16.bin", &RND_VALUES[..32 * 1024], config);
    assert_eq!(receiver.stats().state, TransferState::End);
    assert_eq!(received, &RND_VALUES[..32 * 1024]);
}

#[test]
fn escape_ctrl_transfer() {
    let config = Config {
        zmodem_escape_ctrl: true,
        ..Config::default()
    };
    // A payload dense with control characters to exercise the map.
    let contents: Vec<u8> = (0..16 * 1024).map(|i| (i % 33) as u8).collect();
    let (_, receiver, received) = run_transfer("ctl.bin", &contents, config);
    assert_eq!(receiver.stats().state, TransferState::End);
    assert_eq!(received, contents);
}

#[test]
fn zsinit_attention_exchange() {
    // Only the sender wants control escaping, so it has to ask for it
    // with a ZSINIT round before the first ZFILE.
    let sender_config = Config {
        zmodem_escape_ctrl: true,
        ..Config::default()
    };
    let updir = tempdir().unwrap();
    let downdir = tempdir().unwrap();
    let contents = &RND_VALUES[..8 * 1024];
    let record = write_source(updir.path(), "escaped.bin", contents);

    let mut sender = Session::start_send(Protocol::Zmodem, vec![record], sender_config).unwrap();
    let mut receiver =
        Session::start_receive(Protocol::Zmodem, downdir.path(), Config::default()).unwrap();
    pump(&mut sender, &mut receiver, |_| {});

    assert_eq!(sender.stats().state, TransferState::End);
    assert_eq!(receiver.stats().state, TransferState::End);
    assert_eq!(
        fs::read(downdir.path().join("escaped.bin")).unwrap(),
        contents
    );
}

#[test]
fn zchallenge_round_trip() {
    let config = Config {
        zmodem_zchallenge: true,
        ..Config::default()
    };
    let (_, receiver, received) = run_transfer("challenged.bin", &RND_VALUES[..4096], config);
    assert_eq!(receiver.stats().state, TransferState::End);
    assert_eq!(received, &RND_VALUES[..4096]);
}

#[test]
fn empty_file_transfer() {
    let (_, receiver, received) = run_transfer("zero.bin", &[], Config::default());
    assert_eq!(receiver.stats().state, TransferState::End);
    assert_eq!(received, b"");
}

#[test]
fn sixteen_byte_clean_receive() {
    // The minimal clean exchange: ZRQINIT/ZRINIT, ZFILE, one ZCRCW data
    // subpacket, ZEOF, ZFIN/ZFIN, OO.
    let (_, receiver, received) =
        run_transfer("hello.bin", &RND_VALUES[..16], Config::default());
    assert_eq!(receiver.stats().state, TransferState::End);
    assert_eq!(received.len(), 16);
    assert_eq!(received, &RND_VALUES[..16]);
}

#[test]
fn batch_upload() {
    let updir = tempdir().unwrap();
    let downdir = tempdir().unwrap();
    let records = vec![
        write_source(updir.path(), "a.bin", &RND_VALUES[..3000]),
        write_source(updir.path(), "b.bin", &RND_VALUES[3000..3001]),
        write_source(updir.path(), "c.bin", &RND_VALUES[4096..12000]),
    ];

    let mut sender = Session::start_send(Protocol::Zmodem, records, Config::default()).unwrap();
    let mut receiver =
        Session::start_receive(Protocol::Zmodem, downdir.path(), Config::default()).unwrap();
    pump(&mut sender, &mut receiver, |_| {});

    assert_eq!(
        fs::read(downdir.path().join("a.bin")).unwrap(),
        &RND_VALUES[..3000]
    );
    assert_eq!(
        fs::read(downdir.path().join("b.bin")).unwrap(),
        &RND_VALUES[3000..3001]
    );
    assert_eq!(
        fs::read(downdir.path().join("c.bin")).unwrap(),
        &RND_VALUES[4096..12000]
    );
    assert_eq!(
        sender.stats().batch_bytes_transfer,
        sender.stats().batch_bytes_total
    );
}

#[test]
fn crash_recovery_resumes_from_prefix() {
    // 4 KiB of an 8 KiB file are already on disk; the ZCRC exchange
    // proves it is the same file and the sender resumes at 4096.
    let updir = tempdir().unwrap();
    let downdir = tempdir().unwrap();
    let contents = &RND_VALUES[..8192];
    let record = write_source(updir.path(), "resume.bin", contents);
    fs::write(downdir.path().join("resume.bin"), &contents[..4096]).unwrap();

    let mut sender =
        Session::start_send(Protocol::Zmodem, vec![record], Config::default()).unwrap();
    let mut receiver =
        Session::start_receive(Protocol::Zmodem, downdir.path(), Config::default()).unwrap();
    pump(&mut sender, &mut receiver, |_| {});

    assert_eq!(receiver.stats().state, TransferState::End);
    assert_eq!(
        fs::read(downdir.path().join("resume.bin")).unwrap(),
        contents
    );
}

#[test]
fn identical_file_is_skipped() {
    let updir = tempdir().unwrap();
    let downdir = tempdir().unwrap();
    let contents = &RND_VALUES[..4096];
    let record = write_source(updir.path(), "same.bin", contents);
    fs::write(downdir.path().join("same.bin"), contents).unwrap();

    let mut sender =
        Session::start_send(Protocol::Zmodem, vec![record], Config::default()).unwrap();
    let mut receiver =
        Session::start_receive(Protocol::Zmodem, downdir.path(), Config::default()).unwrap();
    pump(&mut sender, &mut receiver, |_| {});

    assert_eq!(sender.stats().state, TransferState::End);
    assert_eq!(receiver.stats().state, TransferState::End);
    assert_eq!(fs::read(downdir.path().join("same.bin")).unwrap(), contents);
    // No renamed copy appeared.
    assert!(!downdir.path().join("same.bin.0000").exists());
}

#[test]
fn same_name_different_contents_renames() {
    // A second receive of the same filename with different contents
    // yields name.0000; a third yields name.0001.
    let downdir = tempdir().unwrap();
    fs::write(downdir.path().join("report.bin"), &RND_VALUES[..4096]).unwrap();

    for (round, expect) in [("report.bin.0000", 0), ("report.bin.0001", 1usize)] {
        let updir = tempdir().unwrap();
        let contents = &RND_VALUES[8192 + expect * 100..8192 + expect * 100 + 2048];
        let record = write_source(updir.path(), "report.bin", contents);

        let mut sender =
            Session::start_send(Protocol::Zmodem, vec![record], Config::default()).unwrap();
        let mut receiver =
            Session::start_receive(Protocol::Zmodem, downdir.path(), Config::default()).unwrap();
        pump(&mut sender, &mut receiver, |_| {});

        assert_eq!(receiver.stats().state, TransferState::End);
        assert_eq!(fs::read(downdir.path().join(round)).unwrap(), contents);
    }
    // The original was never touched.
    assert_eq!(
        fs::read(downdir.path().join("report.bin")).unwrap(),
        &RND_VALUES[..4096]
    );
}

#[test]
fn corrupted_subpackets_are_repaired_by_zrpos() {
    let updir = tempdir().unwrap();
    let downdir = tempdir().unwrap();
    let contents = &RND_VALUES[..96 * 1024];
    let record = write_source(updir.path(), "noisy.bin", contents);

    let mut sender =
        Session::start_send(Protocol::Zmodem, vec![record], Config::default()).unwrap();
    let mut receiver =
        Session::start_receive(Protocol::Zmodem, downdir.path(), Config::default()).unwrap();

    let mut chunk_count = 0usize;
    let mut min_block_size = u64::MAX;
    let mut to_sender: Vec<u8> = Vec::new();
    let mut rounds = 0;
    loop {
        rounds += 1;
        assert!(rounds < 50_000, "transfer did not converge");

        let mut to_receiver = Vec::new();
        sender.process(&to_sender, &mut to_receiver, OUTPUT_MAX);
        to_sender.clear();
        if sender.stats().block_size > 0 {
            min_block_size = min_block_size.min(sender.stats().block_size);
        }

        // Flip a byte inside roughly every fifth full-size data chunk.
        if to_receiver.len() > 1000 {
            chunk_count += 1;
            if chunk_count % 5 == 0 {
                let at = to_receiver.len() - 600;
                to_receiver[at] ^= 0x55;
            }
        }

        let mut back = Vec::new();
        receiver.process(&to_receiver, &mut back, OUTPUT_MAX);
        to_sender = back;

        if finished(&sender) && finished(&receiver) {
            break;
        }
    }

    assert_eq!(sender.stats().state, TransferState::End);
    assert_eq!(receiver.stats().state, TransferState::End);
    assert_eq!(
        fs::read(downdir.path().join("noisy.bin")).unwrap(),
        contents
    );
    assert!(receiver.stats().error_count > 0);
    // The adaptive block size halves after the burst of unacknowledged
    // data that follows a CRC failure.
    assert!(min_block_size <= 512, "block size never dropped: {}", min_block_size);
}

#[test]
fn four_cans_cancel_mid_transfer() {
    let updir = tempdir().unwrap();
    let downdir = tempdir().unwrap();
    let record = write_source(updir.path(), "doomed.bin", &RND_VALUES[..64 * 1024]);

    let mut sender =
        Session::start_send(Protocol::Zmodem, vec![record], Config::default()).unwrap();
    let mut receiver =
        Session::start_receive(Protocol::Zmodem, downdir.path(), Config::default()).unwrap();

    // Run until the receiver is mid-data (waiting inside a frame).
    let mut to_sender: Vec<u8> = Vec::new();
    for _ in 0..6 {
        let mut to_receiver = Vec::new();
        sender.process(&to_sender, &mut to_receiver, OUTPUT_MAX);
        let mut back = Vec::new();
        receiver.process(&to_receiver, &mut back, OUTPUT_MAX);
        to_sender = back;
    }

    // Four consecutive CANs kill it within one pump call, silently.
    let mut out = Vec::new();
    receiver.process(&[0x18, 0x18, 0x18, 0x18], &mut out, OUTPUT_MAX);
    assert_eq!(receiver.stats().state, TransferState::Abort);
    assert_eq!(
        receiver.stats().last_message,
        "TRANSFER CANCELLED BY SENDER"
    );
    assert!(out.is_empty());

    // The sender side mirrors the behavior.
    let mut out = Vec::new();
    sender.process(&[0x18, 0x18, 0x18, 0x18], &mut out, OUTPUT_MAX);
    assert_eq!(sender.stats().state, TransferState::Abort);
    assert_eq!(
        sender.stats().last_message,
        "TRANSFER CANCELLED BY RECEIVER"
    );
    assert!(out.is_empty());
}

#[test]
fn over_and_out_trailer_is_sent() {
    let updir = tempdir().unwrap();
    let downdir = tempdir().unwrap();
    let record = write_source(updir.path(), "oo.bin", &RND_VALUES[..128]);

    let mut sender =
        Session::start_send(Protocol::Zmodem, vec![record], Config::default()).unwrap();
    let mut receiver =
        Session::start_receive(Protocol::Zmodem, downdir.path(), Config::default()).unwrap();

    let mut last_sender_output = Vec::new();
    let mut to_sender: Vec<u8> = Vec::new();
    for _ in 0..200 {
        let mut to_receiver = Vec::new();
        sender.process(&to_sender, &mut to_receiver, OUTPUT_MAX);
        if !to_receiver.is_empty() {
            last_sender_output = to_receiver.clone();
        }
        let mut back = Vec::new();
        receiver.process(&to_receiver, &mut back, OUTPUT_MAX);
        to_sender = back;
        if finished(&sender) && finished(&receiver) {
            break;
        }
    }
    assert_eq!(sender.stats().state, TransferState::End);
    // The session ends with the two ASCII characters "OO".
    assert_eq!(&last_sender_output[last_sender_output.len() - 2..], b"OO");
}

#[test]
fn modification_time_is_preserved() {
    let updir = tempdir().unwrap();
    let downdir = tempdir().unwrap();
    let record = write_source(updir.path(), "dated.bin", b"timestamped");

    let mut sender =
        Session::start_send(Protocol::Zmodem, vec![record.clone()], Config::default()).unwrap();
    let mut receiver =
        Session::start_receive(Protocol::Zmodem, downdir.path(), Config::default()).unwrap();
    pump(&mut sender, &mut receiver, |_| {});

    let received = fs::metadata(downdir.path().join("dated.bin"))
        .unwrap()
        .modified()
        .unwrap();
    let delta = match received.duration_since(record.modtime) {
        Ok(d) => d,
        Err(e) => e.duration(),
    };
    // The ZFILE mtime field has one-second resolution.
    assert!(delta.as_secs() <= 1, "mtime drifted by {:?}", delta);
}
