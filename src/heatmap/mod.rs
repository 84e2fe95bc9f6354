//! Projection of live block records onto a fixed terminal grid.
//!
//! A device with `N` blocks is divided into `W * H` equal cells of
//! `N / (W * H)` blocks each (a real-valued ratio). Each record's weight is
//! added to the cell containing its address, then every cell is quantized
//! against the frame's hottest cell into one of `K` tiers.

use crate::tracker::RecordView;

/// Grid dimensions in cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GridSize {
    pub width: u16,
    pub height: u16,
}

impl GridSize {
    pub const fn new(width: u16, height: u16) -> Self {
        Self { width, height }
    }

    pub fn cells(self) -> usize {
        usize::from(self.width) * usize::from(self.height)
    }
}

/// One projected frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Heatmap {
    size: GridSize,
    tiers: Vec<u8>,
    tier_count: u8,
    blocks_per_cell: f64,
    peak: u64,
    active_cells: usize,
    excluded: usize,
}

impl Heatmap {
    pub fn size(&self) -> GridSize {
        self.size
    }

    /// Tier of the cell at column `x`, row `y`.
    pub fn tier_at(&self, x: u16, y: u16) -> u8 {
        if x >= self.size.width || y >= self.size.height {
            return 0;
        }
        let idx = usize::from(y) * usize::from(self.size.width) + usize::from(x);
        self.tiers.get(idx).copied().unwrap_or(0)
    }

    /// Row-major tiers, `width * height` long.
    pub fn tiers(&self) -> &[u8] {
        &self.tiers
    }

    /// Number of tiers including the empty tier.
    pub fn tier_count(&self) -> u8 {
        self.tier_count
    }

    pub fn blocks_per_cell(&self) -> f64 {
        self.blocks_per_cell
    }

    /// Largest accumulated cell value in this frame.
    pub fn peak(&self) -> u64 {
        self.peak
    }

    /// Cells with a non-zero tier.
    pub fn active_cells(&self) -> usize {
        self.active_cells
    }

    /// Percentage of cells with any activity.
    pub fn active_percent(&self) -> f64 {
        let cells = self.size.cells();
        if cells == 0 {
            return 0.0;
        }
        self.active_cells as f64 * 100.0 / cells as f64
    }

    /// Records whose address fell beyond the last cell.
    pub fn excluded(&self) -> usize {
        self.excluded
    }

    /// Scale legend, e.g. "1 cell = 10.0 blocks".
    pub fn legend(&self) -> String {
        format!("1 cell = {:.1} blocks", self.blocks_per_cell)
    }
}

/// Reusable projector holding the per-cell accumulation buffer.
#[derive(Debug, Clone)]
pub struct Projector {
    tier_count: u8,
    sums: Vec<u64>,
}

impl Projector {
    /// Create a projector quantizing into `tier_count` tiers (at least 2).
    pub fn new(tier_count: u8) -> Self {
        Self {
            tier_count: tier_count.max(2),
            sums: Vec::new(),
        }
    }

    pub fn tier_count(&self) -> u8 {
        self.tier_count
    }

    /// Project `records` of a device with `total_blocks` blocks onto `size`.
    pub fn project(&mut self, records: &[RecordView], total_blocks: u64, size: GridSize) -> Heatmap {
        let cells = size.cells();
        let blocks_per_cell = blocks_per_cell(total_blocks, cells);

        self.sums.clear();
        self.sums.resize(cells, 0);

        let mut peak = 0u64;
        let mut excluded = 0usize;
        for record in records {
            let Some(idx) = cell_index(record.address, total_blocks, cells) else {
                excluded += 1;
                continue;
            };
            let sum = &mut self.sums[idx];
            *sum = sum.saturating_add(u64::from(record.weight));
            peak = peak.max(*sum);
        }

        let mut active_cells = 0usize;
        let tiers: Vec<u8> = self
            .sums
            .iter()
            .map(|&value| {
                let tier = quantize(value, peak, self.tier_count);
                if tier > 0 {
                    active_cells += 1;
                }
                tier
            })
            .collect();

        Heatmap {
            size,
            tiers,
            tier_count: self.tier_count,
            blocks_per_cell,
            peak,
            active_cells,
            excluded,
        }
    }
}

/// Blocks represented by one cell; 0 when the device reports no blocks.
pub fn blocks_per_cell(total_blocks: u64, cells: usize) -> f64 {
    if cells == 0 {
        return 0.0;
    }
    total_blocks as f64 / cells as f64
}

/// Cell containing `address` on a device of `total_blocks` blocks spread
/// over `cells` cells, or `None` when it lies past the last cell.
///
/// Computes `floor(address / (total_blocks / cells))` in exact integer
/// arithmetic, so the last block of any device stays inside the grid. A
/// device with no known block count maps each address onto the cell with the
/// same index.
pub fn cell_index(address: u64, total_blocks: u64, cells: usize) -> Option<usize> {
    let idx = if total_blocks > 0 {
        let idx = u128::from(address) * cells as u128 / u128::from(total_blocks);
        usize::try_from(idx).ok()?
    } else {
        usize::try_from(address).ok()?
    };

    (idx < cells).then_some(idx)
}

/// Map an accumulated cell value onto `0..tier_count`.
///
/// Tier 0 is reserved for exactly-zero cells; every other value lands in
/// `1..=tier_count - 1`, non-decreasing in `value`.
pub fn quantize(value: u64, peak: u64, tier_count: u8) -> u8 {
    if value == 0 || peak == 0 {
        return 0;
    }
    let top = u64::from(tier_count.max(2)) - 1;
    let scaled = (u128::from(tier_count) * u128::from(value)) / u128::from(peak);
    let tier = u64::try_from(scaled).unwrap_or(top).clamp(1, top);
    tier as u8
}
