//! Drainage directions over flat surfaces.
//!
//! Replaces every undefined D8 direction inside a flat with a direction
//! that leads to lower terrain or nodata, without creating cycles. Two
//! BFS distance fields are combined into a synthetic gradient:
//! `gHigh` (hops from terrain higher than the flat) pushes flow away from
//! high ground, `gLow` (hops from the flat's drains, with double weight)
//! pulls it toward the outlets. Directions then follow the steepest
//! descent of the combined mask among equal-elevation neighbors.
//!
//! Reference:
//! Barnes, R., Lehman, C., & Mulla, D. (2014). An efficient assignment of
//! drainage direction over flat surfaces in raster digital elevation
//! models. *Computers & Geosciences*, 62, 128–135.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};

use ndarray::Array2;

use hydrotile_core::raster::Raster;
use hydrotile_core::{
    Error, RasterElement, Result, FLOW_NODATA, FLOW_UNDEFINED, NEIGHBOR_DISTANCES,
    NEIGHBOR_OFFSETS,
};

/// Offset keeping combined mask values clear of the raw `gLow` seeds.
pub(crate) const FLAT_MASK_BASE: i64 = 1 << 30;

/// Distance value for cells a BFS never reached.
pub(crate) const UNREACHED: u32 = u32::MAX;

#[inline]
fn is_flat(fdr: &Array2<u8>, cell: (usize, usize)) -> bool {
    fdr[cell] == FLOW_UNDEFINED
}

#[inline]
fn is_defined(code: u8) -> bool {
    code < FLOW_UNDEFINED
}

/// Direct flats that touch nodata straight into it.
///
/// A cell left undefined by D8 whose neighborhood contains nodata (or
/// off-raster padding) is a drain of its flat: it takes the direction of
/// the first such neighbor in code order. Applies to cells at least
/// `margin` from the buffer edge.
pub(crate) fn assign_nodata_drains(
    dem: &Array2<f32>,
    fdr: &mut Array2<u8>,
    nodata: Option<f32>,
    margin: usize,
) {
    let (rows, cols) = fdr.dim();
    for row in margin..rows - margin {
        for col in margin..cols - margin {
            if fdr[(row, col)] != FLOW_UNDEFINED {
                continue;
            }
            for (code, &(dr, dc)) in NEIGHBOR_OFFSETS.iter().enumerate() {
                let nr = row as isize + dr;
                let nc = col as isize + dc;
                if nr < 0 || nc < 0 || nr as usize >= rows || nc as usize >= cols {
                    // off-buffer counts as nodata
                    fdr[(row, col)] = code as u8;
                    break;
                }
                if dem[(nr as usize, nc as usize)].is_nodata(nodata) {
                    fdr[(row, col)] = code as u8;
                    break;
                }
            }
        }
    }
}

/// Multi-source unit-cost BFS over flat cells of equal elevation.
///
/// `seeds` carry initial hop counts (unequal seeds are honored exactly
/// via the heap). Expansion is restricted to undefined cells within
/// `margin` whose elevation equals the current cell's.
fn flat_bfs(
    dem: &Array2<f32>,
    fdr: &Array2<u8>,
    margin: usize,
    seeds: &[((usize, usize), u32)],
) -> Array2<u32> {
    let (rows, cols) = fdr.dim();
    let mut dist = Array2::<u32>::from_elem((rows, cols), UNREACHED);
    let mut heap = BinaryHeap::new();

    for &((row, col), d) in seeds {
        if d < dist[(row, col)] {
            dist[(row, col)] = d;
            heap.push(Reverse((d, row, col)));
        }
    }

    while let Some(Reverse((d, row, col))) = heap.pop() {
        if d > dist[(row, col)] {
            continue;
        }
        let z = dem[(row, col)];
        for &(dr, dc) in &NEIGHBOR_OFFSETS {
            let nr = row as isize + dr;
            let nc = col as isize + dc;
            if nr < margin as isize
                || nc < margin as isize
                || nr as usize >= rows - margin
                || nc as usize >= cols - margin
            {
                continue;
            }
            let n = (nr as usize, nc as usize);
            if !is_flat(fdr, n) || dem[n] != z {
                continue;
            }
            let nd = d + 1;
            if nd < dist[n] {
                dist[n] = nd;
                heap.push(Reverse((nd, n.0, n.1)));
            }
        }
    }
    dist
}

/// Local seeds for the away-from-higher field: flat cells with a strictly
/// higher valid neighbor start at hop 1.
pub(crate) fn high_edge_seeds(
    dem: &Array2<f32>,
    fdr: &Array2<u8>,
    nodata: Option<f32>,
    margin: usize,
) -> Vec<((usize, usize), u32)> {
    let (rows, cols) = fdr.dim();
    let mut seeds = Vec::new();
    for row in margin..rows - margin {
        for col in margin..cols - margin {
            if !is_flat(fdr, (row, col)) {
                continue;
            }
            let z = dem[(row, col)];
            let higher = NEIGHBOR_OFFSETS.iter().any(|&(dr, dc)| {
                let nr = row as isize + dr;
                let nc = col as isize + dc;
                if nr < 0 || nc < 0 || nr as usize >= rows || nc as usize >= cols {
                    return false;
                }
                let zn = dem[(nr as usize, nc as usize)];
                !zn.is_nodata(nodata) && zn > z
            });
            if higher {
                seeds.push(((row, col), 1));
            }
        }
    }
    seeds
}

/// Local seeds for the towards-lower field: flat cells adjacent to a
/// drain (a defined cell of equal elevation) start at hop 1.
pub(crate) fn low_edge_seeds(
    dem: &Array2<f32>,
    fdr: &Array2<u8>,
    margin: usize,
) -> Vec<((usize, usize), u32)> {
    let (rows, cols) = fdr.dim();
    let mut seeds = Vec::new();
    for row in margin..rows - margin {
        for col in margin..cols - margin {
            if !is_flat(fdr, (row, col)) {
                continue;
            }
            let z = dem[(row, col)];
            let drains = NEIGHBOR_OFFSETS.iter().any(|&(dr, dc)| {
                let nr = row as isize + dr;
                let nc = col as isize + dc;
                if nr < 0 || nc < 0 || nr as usize >= rows || nc as usize >= cols {
                    return false;
                }
                let n = (nr as usize, nc as usize);
                is_defined(fdr[n]) && dem[n] == z
            });
            if drains {
                seeds.push(((row, col), 1));
            }
        }
    }
    seeds
}

/// Both distance fields, including any cross-tile seeds.
pub(crate) fn flat_distances(
    dem: &Array2<f32>,
    fdr: &Array2<u8>,
    nodata: Option<f32>,
    margin: usize,
    extra_high: &[((usize, usize), u32)],
    extra_low: &[((usize, usize), u32)],
) -> (Array2<u32>, Array2<u32>) {
    let mut high_seeds = high_edge_seeds(dem, fdr, nodata, margin);
    high_seeds.extend_from_slice(extra_high);
    let mut low_seeds = low_edge_seeds(dem, fdr, margin);
    low_seeds.extend_from_slice(extra_low);
    let high = flat_bfs(dem, fdr, margin, &high_seeds);
    let low = flat_bfs(dem, fdr, margin, &low_seeds);
    (high, low)
}

/// Combined gradient mask of a flat cell; `None` when the cell cannot
/// reach a drain (left undefined).
#[inline]
pub(crate) fn flat_mask_value(high: u32, low: u32) -> Option<i64> {
    if low == UNREACHED {
        return None;
    }
    let ghigh = if high == UNREACHED { 0 } else { high as i64 };
    Some(FLAT_MASK_BASE + 2 * low as i64 - ghigh + 1)
}

/// Assign directions to flat cells by steepest descent of the mask.
///
/// Drains (defined cells of equal elevation) compare with mask 2, so a
/// flat cell beside its outlet always steps onto it. Diagonal steps are
/// weighted by √2; ties keep the earliest direction in code order.
pub(crate) fn apply_flat_directions(
    dem: &Array2<f32>,
    fdr: &mut Array2<u8>,
    high: &Array2<u32>,
    low: &Array2<u32>,
    margin: usize,
) {
    let (rows, cols) = fdr.dim();
    for row in margin..rows - margin {
        for col in margin..cols - margin {
            if !is_flat(fdr, (row, col)) {
                continue;
            }
            let Some(mask) = flat_mask_value(high[(row, col)], low[(row, col)]) else {
                continue;
            };
            let z = dem[(row, col)];

            let mut best_code = FLOW_UNDEFINED;
            let mut best_drop = 0.0f64;
            for (code, &(dr, dc)) in NEIGHBOR_OFFSETS.iter().enumerate() {
                let nr = row as isize + dr;
                let nc = col as isize + dc;
                if nr < 0 || nc < 0 || nr as usize >= rows || nc as usize >= cols {
                    continue;
                }
                let n = (nr as usize, nc as usize);
                if dem[n] != z {
                    continue;
                }
                let mask_n = if is_defined(fdr[n]) {
                    2
                } else {
                    match flat_mask_value(high[n], low[n]) {
                        Some(m) => m,
                        None => continue,
                    }
                };
                let drop = (mask - mask_n) as f64 / NEIGHBOR_DISTANCES[code];
                if drop > best_drop {
                    best_drop = drop;
                    best_code = code as u8;
                }
            }
            if best_code != FLOW_UNDEFINED {
                fdr[(row, col)] = best_code;
            }
        }
    }
}

/// Resolve flats of an in-memory direction raster.
///
/// Returns a new raster where every cell that can drain has a direction
/// in `0..8`; on a conditioned DEM no undefined cells remain.
pub fn resolve_flats(dem: &Raster<f32>, fdr: &Raster<u8>) -> Result<Raster<u8>> {
    let (rows, cols) = dem.shape();
    if fdr.shape() != (rows, cols) {
        return Err(Error::SizeMismatch {
            er: rows,
            ec: cols,
            ar: fdr.rows(),
            ac: fdr.cols(),
        });
    }
    let pad_z = dem.nodata().unwrap_or(f32::NAN);

    let mut dem_buf = Array2::from_elem((rows + 2, cols + 2), pad_z);
    dem_buf
        .slice_mut(ndarray::s![1..rows + 1, 1..cols + 1])
        .assign(dem.data());
    let mut fdr_buf = Array2::from_elem((rows + 2, cols + 2), FLOW_NODATA);
    fdr_buf
        .slice_mut(ndarray::s![1..rows + 1, 1..cols + 1])
        .assign(fdr.data());

    assign_nodata_drains(&dem_buf, &mut fdr_buf, dem.nodata(), 1);
    let (high, low) = flat_distances(&dem_buf, &fdr_buf, dem.nodata(), 1, &[], &[]);
    apply_flat_directions(&dem_buf, &mut fdr_buf, &high, &low, 1);

    let mut output = fdr.with_same_meta::<u8>(rows, cols);
    output.set_nodata(Some(FLOW_NODATA));
    *output.data_mut() = fdr_buf
        .slice(ndarray::s![1..rows + 1, 1..cols + 1])
        .to_owned();
    Ok(output)
}

/// Within-tile minimum hop distances between perimeter flat cells of the
/// same flat, used by the tiled global graph.
///
/// Returns, for each perimeter flat cell, its buffer coordinates and the
/// distances to every other perimeter flat cell its flat reaches.
pub(crate) fn perimeter_flat_distances(
    dem: &Array2<f32>,
    fdr: &Array2<u8>,
    margin: usize,
) -> Vec<((usize, usize), HashMap<(usize, usize), u32>)> {
    let (rows, cols) = fdr.dim();
    let mut perimeter = Vec::new();
    for row in margin..rows - margin {
        for col in margin..cols - margin {
            let on_ring = row == margin
                || row == rows - margin - 1
                || col == margin
                || col == cols - margin - 1;
            if on_ring && is_flat(fdr, (row, col)) {
                perimeter.push((row, col));
            }
        }
    }

    let mut result = Vec::with_capacity(perimeter.len());
    for &cell in &perimeter {
        let dist = flat_bfs(dem, fdr, margin, &[(cell, 0)]);
        let mut reached = HashMap::new();
        for &other in &perimeter {
            if other != cell && dist[other] != UNREACHED {
                reached.insert(other, dist[other]);
            }
        }
        result.push((cell, reached));
    }
    result
}
