use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;

const HEADER_LEN: u32 = 36;
const BYTES_PER_SAMPLE: u16 = 2;

/// Write 16-bit mono PCM samples as a canonical WAV stream.
pub fn write<W: Write>(mut writer: W, samples: &[i16], sample_rate: u32) -> io::Result<()> {
    let data_len = u32::try_from(samples.len() * usize::from(BYTES_PER_SAMPLE))
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "too many samples for WAV"))?;

    writer.write_all(b"RIFF")?;
    writer.write_all(&(HEADER_LEN + data_len).to_le_bytes())?;
    writer.write_all(b"WAVEfmt ")?;
    // fmt chunk length, PCM format, 1 channel
    writer.write_all(&16_u32.to_le_bytes())?;
    writer.write_all(&1_u16.to_le_bytes())?;
    writer.write_all(&1_u16.to_le_bytes())?;
    writer.write_all(&sample_rate.to_le_bytes())?;
    writer.write_all(&(sample_rate * u32::from(BYTES_PER_SAMPLE)).to_le_bytes())?;
    writer.write_all(&BYTES_PER_SAMPLE.to_le_bytes())?;
    writer.write_all(&16_u16.to_le_bytes())?;
    writer.write_all(b"data")?;
    writer.write_all(&data_len.to_le_bytes())?;
    for sample in samples {
        writer.write_all(&sample.to_le_bytes())?;
    }

    writer.flush()
}

pub fn write_file(path: &Path, samples: &[i16], sample_rate: u32) -> io::Result<()> {
    write(BufWriter::new(File::create(path)?), samples, sample_rate)
}
