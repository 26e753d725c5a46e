use hapz_lib::cli::{CompressConfig, DecompressConfig};
use hapz_lib::compression::{
    self, decode_range, AlleleWindow, Archive, CompressionSettings, DecodeSession, QuerySpec, VecKind,
};
use hapz_lib::QueryError;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

fn set_bit(vec: &mut [u8], h: usize) {
    vec[h / 8] |= 0x80 >> (h % 8);
}

fn bit(vec: &[u8], h: usize) -> bool {
    vec[h / 8] & (0x80 >> (h % 8)) != 0
}

fn clear_padding(vec: &mut [u8], n_haps: usize) {
    let used = n_haps % 8;
    if used != 0 {
        let last = vec.len() - 1;
        vec[last] &= !(0xffu8 >> used);
    }
}

/// Two planes per site: plane 0 carries rare non-ref/non-alt calls, plane 1
/// mixes zero sites, exact repeats, near repeats and fresh sparse vectors.
fn synthetic_panel(seed: u64, n_haps: usize, n_sites: usize) -> Vec<u8> {
    let mut rng = StdRng::seed_from_u64(seed);
    let vec_len = n_haps.div_ceil(8);
    let mut vectors: Vec<Vec<u8>> = Vec::with_capacity(n_sites * 2);
    for _ in 0..n_sites {
        let mut p0 = vec![0u8; vec_len];
        if rng.gen_bool(0.1) {
            for _ in 0..rng.gen_range(1..4) {
                set_bit(&mut p0, rng.gen_range(0..n_haps));
            }
        }
        let recent = vectors.len().saturating_sub(40)..vectors.len().max(1);
        let mut p1 = match rng.gen_range(0..10) {
            0..=2 => vec![0u8; vec_len],
            3..=4 if !vectors.is_empty() => vectors[rng.gen_range(recent)].clone(),
            5..=7 if !vectors.is_empty() => {
                let mut v = vectors[rng.gen_range(recent)].clone();
                for _ in 0..rng.gen_range(1..4) {
                    let h = rng.gen_range(0..n_haps);
                    v[h / 8] ^= 0x80 >> (h % 8);
                }
                v
            }
            _ => (0..vec_len)
                .map(|_| if rng.gen_bool(0.3) { rng.gen() } else { 0 })
                .collect(),
        };
        clear_padding(&mut p0, n_haps);
        clear_padding(&mut p1, n_haps);
        vectors.push(p0);
        vectors.push(p1);
    }
    vectors.concat()
}

fn settings(n_samples: u32, variants_per_block: u32, config_fn: impl FnOnce(&mut CompressConfig)) -> CompressionSettings {
    let mut config = CompressConfig {
        n_samples,
        ploidy: 2,
        variants_per_block,
        ..CompressConfig::default()
    };
    config_fn(&mut config);
    CompressionSettings::from_config(&config).unwrap()
}

/// Selected haplotypes of `vec`, packed MSB-first in the given order.
fn project(vec: &[u8], haps: &[usize]) -> Vec<u8> {
    let mut out = vec![0u8; haps.len().div_ceil(8)];
    for (k, &h) in haps.iter().enumerate() {
        if bit(vec, h) {
            set_bit(&mut out, k);
        }
    }
    out
}

fn haplotypes_of(samples: &[u32], ploidy: usize) -> Vec<usize> {
    samples
        .iter()
        .flat_map(|&s| (0..ploidy).map(move |k| s as usize * ploidy + k))
        .collect()
}

/// Compress `data` through files with the given overrides.
fn compress_file(dir: &Path, data: &[u8], config_fn: impl FnOnce(&mut CompressConfig)) -> PathBuf {
    let input = dir.join("input.bin");
    fs::write(&input, data).unwrap();
    let archive_path = dir.join("test.hz");
    let mut args = CompressConfig {
        input,
        output: archive_path.clone(),
        threads: 2,
        ..CompressConfig::default()
    };
    config_fn(&mut args);
    compression::compress(&args).unwrap();
    assert!(archive_path.exists());
    archive_path
}

/// Helper to create default DecompressConfig
fn decompress_args(input: PathBuf, output: PathBuf) -> DecompressConfig {
    DecompressConfig {
        input,
        output,
        threads: 2,
        ..DecompressConfig::default()
    }
}

#[test]
fn test_compress_decompress_roundtrip() {
    let temp_dir = TempDir::new().unwrap();
    let data = synthetic_panel(7, 100, 400);
    let archive_path = compress_file(temp_dir.path(), &data, |c| {
        c.n_samples = 50;
        c.variants_per_block = 128;
    });

    let output = temp_dir.path().join("decompressed.bin");
    compression::decompress(&decompress_args(archive_path.clone(), output.clone())).unwrap();
    assert_eq!(fs::read(&output).unwrap(), data);
    assert!(fs::metadata(&archive_path).unwrap().len() < data.len() as u64);
}

#[test]
fn test_four_vector_scenario() {
    // 12 samples x 2 = 24 haplotypes = 3 bytes per vector
    let s = settings(12, 3584, |c| c.permute = false);
    let data: [u8; 12] = [0, 0, 0, 1, 2, 3, 1, 2, 3, 0, 0, 0];
    let archive = compression::open(compression::compress_bytes(&data, &s, 1).unwrap()).unwrap();

    assert_eq!(archive.classify(0).unwrap(), VecKind::Zero);
    assert_eq!(archive.classify(1).unwrap(), VecKind::Unique { unique: 0 });
    assert_eq!(archive.classify(2).unwrap(), VecKind::Copy { unique: 0 });
    assert_eq!(archive.classify(3).unwrap(), VecKind::Zero);
    assert_eq!(archive.copy_no(), 1);
    assert_eq!(archive.unique_no(), 1);

    let mut session = DecodeSession::new(&archive);
    assert_eq!(session.decode_vector(2).unwrap(), vec![1, 2, 3]);
    assert_eq!(archive.decode_all().unwrap(), data);
}

#[test]
fn test_trailing_ones_roundtrip() {
    // 400 haplotypes = 50 bytes; 20 trailing 0xff bytes
    let s = settings(200, 3584, |_| {});
    let mut vec: Vec<u8> = (0..30u8).map(|b| b.wrapping_mul(71) | 1).collect();
    vec.extend([0xffu8; 20]);
    let mut data = vec![0u8; 50];
    data.extend(&vec);
    let archive = Archive::open(compression::compress_bytes(&data, &s, 1).unwrap()).unwrap();
    assert_eq!(archive.decode_all().unwrap(), data);
}

#[test]
fn test_roundtrip_across_settings() {
    let data = synthetic_panel(11, 61, 500);
    // haploid, 61 haplotypes: three padding bits per vector
    let variants: [(u32, u32, bool, u32); 4] = [(64, 100, true, 8), (50, 0, true, 8), (200, 3, false, 1), (33, 100, true, 32)];
    for (variants_per_block, max_depth, permute, ones_ranges) in variants {
        let s = CompressionSettings::from_config(&CompressConfig {
            n_samples: 61,
            ploidy: 1,
            variants_per_block,
            max_depth,
            permute,
            ones_ranges,
            ..CompressConfig::default()
        })
        .unwrap();
        let archive = Archive::open(compression::compress_bytes(&data, &s, 3).unwrap()).unwrap();
        assert_eq!(
            archive.decode_all().unwrap(),
            data,
            "block {variants_per_block}, depth {max_depth}, permute {permute}, groups {ones_ranges}"
        );
    }
}

#[test]
fn test_small_offset_widths_roundtrip() {
    let data = synthetic_panel(5, 48, 300);
    let s = settings(24, 100, |c| {
        c.match_pos_diff_bits = 3;
        c.copy_pos_diff_bits = 2;
    });
    let archive = Archive::open(compression::compress_bytes(&data, &s, 2).unwrap()).unwrap();
    assert_eq!(archive.decode_all().unwrap(), data);
}

#[test]
fn test_projected_decode_across_matcher_settings() {
    // 37 samples x 2 = 74 haplotypes, 10 bytes per vector with padding
    let n_samples = 37u32;
    let n_haps: usize = 74;
    let vec_len = n_haps.div_ceil(8);
    let data = synthetic_panel(41, n_haps, 600);
    let samples = vec![36u32, 0, 18, 5, 29];
    let haps = haplotypes_of(&samples, 2);

    for permute in [false, true] {
        for max_depth in [0u32, 1, 255] {
            for match_bits in [2u32, 8] {
                let s = settings(n_samples, 256, |c| {
                    c.permute = permute;
                    c.max_depth = max_depth;
                    c.match_pos_diff_bits = match_bits;
                });
                let label = format!("permute {permute}, depth {max_depth}, match bits {match_bits}");
                let archive = Archive::open(compression::compress_bytes(&data, &s, 3).unwrap()).unwrap();
                assert_eq!(archive.decode_all().unwrap(), data, "{label}");
                if permute {
                    let reordered = (0..archive.no_blocks()).any(|b| {
                        let perm = archive.permutation(b).unwrap();
                        perm.iter().enumerate().any(|(h, &p)| p as usize != h)
                    });
                    assert!(reordered, "{label}");
                }

                let spec = QuerySpec {
                    sites: Some(45..590),
                    samples: Some(samples.clone()),
                    ..QuerySpec::default()
                };
                let records = decode_range(&archive, &spec).unwrap();
                assert_eq!(records.len(), 545, "{label}");
                for rec in &records {
                    let v0 = &data[rec.site as usize * 2 * vec_len..][..vec_len];
                    let v1 = &data[(rec.site as usize * 2 + 1) * vec_len..][..vec_len];
                    assert_eq!(rec.planes[0], project(v0, &haps), "site {} plane 0, {label}", rec.site);
                    assert_eq!(rec.planes[1], project(v1, &haps), "site {} plane 1, {label}", rec.site);
                }
            }
        }
    }
}

#[test]
fn test_range_decode_matches_full_decode() {
    let n_samples = 20u32;
    let data = synthetic_panel(23, 40, 300);
    let s = settings(n_samples, 64, |_| {});
    let archive = Archive::open(compression::compress_bytes(&data, &s, 3).unwrap()).unwrap();
    let vec_len = archive.vec_len();

    let queries = [
        (Some(0..300), None, None),
        (Some(17..150), Some(vec![3u32]), None),
        (Some(60..70), Some(vec![19, 0, 7, 7]), None),
        (None, Some(vec![5, 6, 7, 8, 9, 10, 11, 12, 13]), Some(40u64)),
        (Some(250..300), None, Some(3)),
        (Some(100..100), Some(vec![1]), None),
    ];
    for (sites, samples, limit) in queries {
        let spec = QuerySpec {
            sites: sites.clone(),
            samples: samples.clone(),
            limit,
            allele_window: AlleleWindow::default(),
        };
        let records = decode_range(&archive, &spec).unwrap();
        let range = sites.unwrap_or(0..300);
        let expected_len = ((range.end - range.start) as usize).min(limit.unwrap_or(u64::MAX) as usize);
        assert_eq!(records.len(), expected_len, "{spec:?}");

        for rec in &records {
            let v0 = &data[rec.site as usize * 2 * vec_len..][..vec_len];
            let v1 = &data[(rec.site as usize * 2 + 1) * vec_len..][..vec_len];
            let haps: Vec<usize> = match &samples {
                Some(samples) => haplotypes_of(samples, 2),
                None => (0..40).collect(),
            };
            assert_eq!(rec.planes[0], project(v0, &haps), "site {} plane 0 of {spec:?}", rec.site);
            assert_eq!(rec.planes[1], project(v1, &haps), "site {} plane 1 of {spec:?}", rec.site);
            let ac = haps.iter().filter(|&&h| !bit(v0, h) && bit(v1, h)).count() as u32;
            assert_eq!(rec.ac_an, (ac, haps.len() as u32));
        }
    }
}

#[test]
fn test_cache_settings_do_not_change_output() {
    let data = synthetic_panel(31, 64, 200);
    let s = settings(32, 50, |_| {});
    let archive = Archive::open(compression::compress_bytes(&data, &s, 2).unwrap()).unwrap();
    let query = archive
        .prepare(&QuerySpec {
            samples: Some(vec![4, 30, 12]),
            ..QuerySpec::default()
        })
        .unwrap();
    let cached = DecodeSession::with_cache(&archive, 0, true).decode_range(&query).unwrap();
    let uncached = DecodeSession::with_cache(&archive, 0, false).decode_range(&query).unwrap();
    let budgeted = DecodeSession::with_cache(&archive, 1, true).decode_range(&query).unwrap();
    assert_eq!(cached, uncached);
    assert_eq!(cached, budgeted);
    assert_eq!(DecodeSession::with_cache(&archive, 0, false).cache_capacity(), 0);
}

#[test]
fn test_decompress_subset_to_file() {
    let temp_dir = TempDir::new().unwrap();
    let data = synthetic_panel(3, 30, 120);
    let archive_path = compress_file(temp_dir.path(), &data, |c| {
        c.n_samples = 15;
        c.variants_per_block = 32;
    });

    let output = temp_dir.path().join("subset.bin");
    let args = DecompressConfig {
        sites: Some(10..50),
        samples: Some(vec![14, 2]),
        mmap: true,
        ..decompress_args(archive_path, output.clone())
    };
    compression::decompress(&args).unwrap();

    let vec_len = 4;
    let haps = haplotypes_of(&[14, 2], 2);
    let mut expected = Vec::new();
    for v in 20..100 {
        expected.extend(project(&data[v * vec_len..(v + 1) * vec_len], &haps));
    }
    assert_eq!(fs::read(&output).unwrap(), expected);
}

#[test]
fn test_allele_filter_and_limit_to_file() {
    let temp_dir = TempDir::new().unwrap();
    let data = synthetic_panel(17, 32, 150);
    let archive_path = compress_file(temp_dir.path(), &data, |c| {
        c.n_samples = 16;
        c.variants_per_block = 40;
    });

    let output = temp_dir.path().join("filtered.bin");
    let args = DecompressConfig {
        limit: Some(25),
        allele_filter: AlleleWindow {
            min_ac: 2,
            max_af: 0.5,
            ..AlleleWindow::default()
        },
        ..decompress_args(archive_path, output.clone())
    };
    compression::decompress(&args).unwrap();

    let mut expected = Vec::new();
    let mut kept = 0;
    for site in data.chunks_exact(8) {
        let (v0, v1) = site.split_at(4);
        let ac = (0..32).filter(|&h| !bit(v0, h) && bit(v1, h)).count();
        if (2..=16).contains(&ac) && kept < 25 {
            expected.extend_from_slice(site);
            kept += 1;
        }
    }
    assert!(kept > 0);
    assert_eq!(fs::read(&output).unwrap(), expected);
}

#[test]
fn test_query_errors_are_typed() {
    let temp_dir = TempDir::new().unwrap();
    let data = synthetic_panel(1, 16, 20);
    let archive_path = compress_file(temp_dir.path(), &data, |c| c.n_samples = 8);

    let args = DecompressConfig {
        samples: Some(vec![8]),
        ..decompress_args(archive_path.clone(), temp_dir.path().join("out.bin"))
    };
    let err = compression::decompress(&args).unwrap_err();
    assert_eq!(
        err.downcast_ref::<QueryError>(),
        Some(&QueryError::SampleOutOfRange { index: 8, n_samples: 8 })
    );

    let args = DecompressConfig {
        sites: Some(5..21),
        ..decompress_args(archive_path, temp_dir.path().join("out.bin"))
    };
    let err = compression::decompress(&args).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<QueryError>(),
        Some(QueryError::SiteRangeOutOfBounds { n_sites: 20, .. })
    ));
}

#[test]
fn test_truncated_archive_rejected() {
    let temp_dir = TempDir::new().unwrap();
    let data = synthetic_panel(2, 16, 50);
    let archive_path = compress_file(temp_dir.path(), &data, |c| c.n_samples = 8);
    let bytes = fs::read(&archive_path).unwrap();
    fs::write(&archive_path, &bytes[..bytes.len() / 3]).unwrap();

    let args = decompress_args(archive_path, temp_dir.path().join("out.bin"));
    assert!(compression::decompress(&args).is_err());
}

#[test]
fn test_layout_mismatch_rejected() {
    let temp_dir = TempDir::new().unwrap();
    let input = temp_dir.path().join("input.bin");
    // 7 bytes cannot be split into 2-byte vectors
    fs::write(&input, [0u8; 7]).unwrap();
    let args = CompressConfig {
        input,
        output: temp_dir.path().join("out.hz"),
        n_samples: 8,
        threads: 1,
        ..CompressConfig::default()
    };
    assert!(compression::compress(&args).is_err());
}
