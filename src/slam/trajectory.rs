//! TUM trajectory files: one `timestamp tx ty tz qx qy qz qw` line per pose.

use anyhow::{anyhow, Context, Result};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use super::Pose;

pub fn write_tum<W: Write>(mut out: W, poses: &[(f64, Pose)]) -> Result<()> {
    for (timestamp, pose) in poses {
        let [tx, ty, tz] = pose.translation;
        let [qx, qy, qz, qw] = pose.rotation;
        writeln!(
            out,
            "{:.6} {:.7} {:.7} {:.7} {:.7} {:.7} {:.7} {:.7}",
            timestamp, tx, ty, tz, qx, qy, qz, qw
        )?;
    }
    out.flush()?;
    Ok(())
}

pub fn save_tum(path: &Path, poses: &[(f64, Pose)]) -> Result<()> {
    let file = File::create(path)
        .with_context(|| format!("create trajectory file {}", path.display()))?;
    write_tum(BufWriter::new(file), poses)
        .with_context(|| format!("write trajectory file {}", path.display()))
}

/// Parse TUM text. Blank lines and `#` comments are skipped.
pub fn parse_tum(text: &str) -> Result<Vec<(f64, Pose)>> {
    let mut poses = Vec::new();
    for (lineno, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let values = line
            .split_whitespace()
            .map(str::parse::<f64>)
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| anyhow!("line {}: {}", lineno + 1, e))?;
        let [t, tx, ty, tz, qx, qy, qz, qw] = values[..] else {
            return Err(anyhow!(
                "line {}: expected 8 values, got {}",
                lineno + 1,
                values.len()
            ));
        };
        poses.push((
            t,
            Pose {
                translation: [tx, ty, tz],
                rotation: [qx, qy, qz, qw],
            },
        ));
    }
    Ok(poses)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_one_line_per_pose() -> Result<()> {
        let mut buf = Vec::new();
        let moved = Pose {
            translation: [0.5, -0.25, 1.0],
            rotation: [0.0, 0.0, 0.0, 1.0],
        };
        write_tum(&mut buf, &[(0.0, Pose::identity()), (1.5, moved)])?;
        let text = String::from_utf8(buf)?;
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(
            lines[1],
            "1.500000 0.5000000 -0.2500000 1.0000000 0.0000000 0.0000000 0.0000000 1.0000000"
        );

        let parsed = parse_tum(&text)?;
        assert_eq!(parsed[1], (1.5, moved));
        Ok(())
    }

    #[test]
    fn parse_rejects_short_lines() {
        assert!(parse_tum("# header\n1.0 2.0 3.0\n").is_err());
        assert!(parse_tum("1.0 a 0 0 0 0 0 1\n").is_err());
    }
}
