//! Classic pcap file writer, shared by all three ports.

use std::fs::File;
use std::io::{self, Write};
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use tracing::error;

const PCAP_MAGIC: u32 = 0xa1b2c3d4;
const PCAP_MAJOR: u16 = 2;
const PCAP_MINOR: u16 = 4;
const LINKTYPE_ETHERNET: u32 = 1;

pub struct PcapWriter {
    file: Mutex<File>,
}

impl PcapWriter {
    pub fn create(path: &str, snaplen: u32) -> io::Result<Self> {
        let mut file = File::create(path)?;
        file.write_all(&PCAP_MAGIC.to_le_bytes())?;
        file.write_all(&PCAP_MAJOR.to_le_bytes())?;
        file.write_all(&PCAP_MINOR.to_le_bytes())?;
        file.write_all(&0i32.to_le_bytes())?; // reserved1
        file.write_all(&0i32.to_le_bytes())?; // reserved2
        file.write_all(&snaplen.to_le_bytes())?;
        file.write_all(&LINKTYPE_ETHERNET.to_le_bytes())?;
        Ok(Self { file: Mutex::new(file) })
    }

    /// Write one captured frame. Failures are logged, not propagated: a
    /// capture problem must never interrupt the bridge's data path.
    pub fn save(&self, buf: &[u8]) {
        let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
        let mut file = self.file.lock();
        let header_write = (|| -> io::Result<()> {
            file.write_all(&(now.as_secs() as u32).to_le_bytes())?;
            file.write_all(&(now.subsec_micros() as i32).to_le_bytes())?;
            file.write_all(&(buf.len() as i32).to_le_bytes())?;
            file.write_all(&(buf.len() as i32).to_le_bytes())?;
            file.write_all(buf)
        })();
        if let Err(e) = header_write {
            error!(error = %e, "pcap write failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    #[test]
    fn header_and_record_round_trip() {
        let path = std::env::temp_dir().join(format!("endoor-test-{}.pcap", std::process::id()));
        let path_str = path.to_str().unwrap();
        {
            let w = PcapWriter::create(path_str, 4096).unwrap();
            w.save(&[1, 2, 3, 4]);
        }

        let mut buf = Vec::new();
        File::open(&path).unwrap().read_to_end(&mut buf).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(u32::from_le_bytes(buf[0..4].try_into().unwrap()), PCAP_MAGIC);
        assert_eq!(u16::from_le_bytes(buf[4..6].try_into().unwrap()), PCAP_MAJOR);
        assert_eq!(u16::from_le_bytes(buf[6..8].try_into().unwrap()), PCAP_MINOR);
        assert_eq!(u32::from_le_bytes(buf[16..20].try_into().unwrap()), 4096);
        assert_eq!(u32::from_le_bytes(buf[20..24].try_into().unwrap()), LINKTYPE_ETHERNET);

        let record = &buf[24..];
        let caplen = i32::from_le_bytes(record[8..12].try_into().unwrap());
        let origlen = i32::from_le_bytes(record[12..16].try_into().unwrap());
        assert_eq!(caplen, 4);
        assert_eq!(origlen, 4);
        assert_eq!(&record[16..20], &[1, 2, 3, 4]);
    }
}
