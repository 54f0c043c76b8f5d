use std::fmt::Write;

use crate::builder::StreamingGrid;

/// Human-readable dump of generated grids: per-grid settings, per-level
/// statistics, then every cell.
pub fn dump_state(grids: &[StreamingGrid]) -> String {
    let mut out = String::new();
    // Writing into a String cannot fail.
    let _ = write_state(&mut out, grids);
    out
}

fn write_state(out: &mut String, grids: &[StreamingGrid]) -> std::fmt::Result {
    writeln!(out, "---- Runtime spatial hash: {} grid(s) ----", grids.len())?;
    for grid in grids {
        writeln!(out, "Grid {}", grid.name)?;
        writeln!(out, "  Origin: ({}, {})", grid.origin[0], grid.origin[1])?;
        writeln!(out, "  Cell Size: {}", grid.cell_size)?;
        writeln!(
            out,
            "  World Bounds: min ({:.1}, {:.1}, {:.1}) max ({:.1}, {:.1}, {:.1})",
            grid.world_bounds.min.x,
            grid.world_bounds.min.y,
            grid.world_bounds.min.z,
            grid.world_bounds.max.x,
            grid.world_bounds.max.y,
            grid.world_bounds.max.z
        )?;
        writeln!(out, "  Loading Range: {:.1}", grid.loading_range)?;
        writeln!(out, "  Block On Slow Loading: {}", grid.block_on_slow_streaming)?;
        writeln!(out, "  Client Only Visible: {}", grid.client_only_visible)?;

        let total: usize = grid.cells().map(|c| c.members.len()).sum();
        for level in &grid.levels {
            let count: usize = level.cells.iter().map(|c| c.members.len()).sum();
            let pct = if total == 0 {
                0.0
            } else {
                100.0 * count as f64 / total as f64
            };
            writeln!(
                out,
                "  Level {:2}: Cell Count {:4} | Cell Size {:7} | Object Count {:4} ({:3.1}%)",
                level.level,
                level.cells.len(),
                level.cell_size,
                count,
                pct
            )?;
        }

        for cell in grid.cells() {
            writeln!(
                out,
                "    {}{} objects={} layers={} aggregates={}",
                cell.name,
                if cell.always_loaded { " (AlwaysLoaded)" } else { "" },
                cell.members.len(),
                cell.layers,
                cell.aggregate_ids.len()
            )?;
        }
    }
    Ok(())
}
