use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::path::Path;

use rand::Rng;

use crate::world::location::LocationVector;

/// Agent dimensions the mesh was baked for.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AgentParams {
    pub height: f64,
    pub radius: f64,
    pub max_climb: f64,
    pub max_slope: f64,
}

impl Default for AgentParams {
    fn default() -> Self {
        Self {
            height: 2.0,
            radius: 0.5,
            max_climb: 0.5,
            max_slope: 45.0,
        }
    }
}

/// Walkable-cell grid for one district. Immutable after load; queries take
/// `&self` and need no lock.
#[derive(Debug, Clone)]
pub struct NavMesh {
    width: usize,
    height: usize,
    cell_size: f64,
    origin_x: f64,
    origin_y: f64,
    agent: AgentParams,
    cells: Vec<bool>,
}

impl NavMesh {
    /// Grid with every cell walkable, used when a district ships no nav file.
    pub fn open(width: usize, height: usize, cell_size: f64, origin_x: f64, origin_y: f64) -> Self {
        Self {
            width,
            height,
            cell_size,
            origin_x,
            origin_y,
            agent: AgentParams::default(),
            cells: vec![true; width * height],
        }
    }

    pub fn load(path: &Path) -> Result<Self, String> {
        let text = std::fs::read_to_string(path)
            .map_err(|err| format!("nav file read failed for {}: {}", path.display(), err))?;
        Self::parse(&text).map_err(|err| format!("nav file {}: {}", path.display(), err))
    }

    /// Header of `key=value` lines, then `height` rows of `.` (walkable) and
    /// `#` (blocked), top row first.
    pub fn parse(text: &str) -> Result<Self, String> {
        let mut width = None;
        let mut height = None;
        let mut cell_size = 1.0f64;
        let mut origin_x = 0.0f64;
        let mut origin_y = 0.0f64;
        let mut agent = AgentParams::default();
        let mut rows: Vec<Vec<bool>> = Vec::new();
        let mut in_rows = false;

        for (idx, raw_line) in text.lines().enumerate() {
            let line_no = idx + 1;
            let line = raw_line.trim_end();
            if !in_rows {
                let trimmed = line.trim();
                if trimmed.is_empty() || trimmed.starts_with('#') {
                    continue;
                }
                if let Some((key, value)) = trimmed.split_once('=') {
                    let key = key.trim();
                    let value = value.trim();
                    match key {
                        "width" => width = Some(parse_usize(value, key, line_no)?),
                        "height" => height = Some(parse_usize(value, key, line_no)?),
                        "cell" => cell_size = parse_f64(value, key, line_no)?,
                        "origin_x" => origin_x = parse_f64(value, key, line_no)?,
                        "origin_y" => origin_y = parse_f64(value, key, line_no)?,
                        "agent_height" => agent.height = parse_f64(value, key, line_no)?,
                        "agent_radius" => agent.radius = parse_f64(value, key, line_no)?,
                        "agent_max_climb" => agent.max_climb = parse_f64(value, key, line_no)?,
                        "agent_max_slope" => agent.max_slope = parse_f64(value, key, line_no)?,
                        other => {
                            return Err(format!("unknown nav header '{}' at line {}", other, line_no))
                        }
                    }
                    continue;
                }
                if trimmed == "rows" {
                    in_rows = true;
                    continue;
                }
                return Err(format!("expected key=value or 'rows' at line {}", line_no));
            }

            let mut row = Vec::with_capacity(line.len());
            for ch in line.chars() {
                match ch {
                    '.' => row.push(true),
                    '#' => row.push(false),
                    other => {
                        return Err(format!("invalid nav cell '{}' at line {}", other, line_no))
                    }
                }
            }
            rows.push(row);
        }

        let width = width.ok_or_else(|| "nav header missing width".to_string())?;
        let height = height.ok_or_else(|| "nav header missing height".to_string())?;
        if cell_size <= 0.0 {
            return Err("nav cell size must be positive".to_string());
        }
        if rows.len() != height {
            return Err(format!("expected {} rows, got {}", height, rows.len()));
        }
        let mut cells = Vec::with_capacity(width * height);
        for (idx, row) in rows.iter().enumerate() {
            if row.len() != width {
                return Err(format!("row {} has {} cells, expected {}", idx + 1, row.len(), width));
            }
            cells.extend_from_slice(row);
        }
        Ok(Self {
            width,
            height,
            cell_size,
            origin_x,
            origin_y,
            agent,
            cells,
        })
    }

    pub fn agent(&self) -> AgentParams {
        self.agent
    }

    fn cell_of(&self, pos: &LocationVector) -> Option<(usize, usize)> {
        let cx = (pos.x - self.origin_x) / self.cell_size;
        let cy = (pos.y - self.origin_y) / self.cell_size;
        if cx < 0.0 || cy < 0.0 {
            return None;
        }
        let (cx, cy) = (cx as usize, cy as usize);
        if cx >= self.width || cy >= self.height {
            return None;
        }
        Some((cx, cy))
    }

    fn cell_center(&self, cx: usize, cy: usize) -> LocationVector {
        LocationVector::new(
            self.origin_x + (cx as f64 + 0.5) * self.cell_size,
            self.origin_y + (cy as f64 + 0.5) * self.cell_size,
            0.0,
        )
    }

    fn walkable(&self, cx: usize, cy: usize) -> bool {
        self.cells[cy * self.width + cx]
    }

    pub fn is_position_valid(&self, pos: &LocationVector) -> bool {
        match self.cell_of(pos) {
            Some((cx, cy)) => self.walkable(cx, cy),
            None => false,
        }
    }

    /// Ring search outward from the position's cell, bounded by
    /// `max_distance`. Falls back to the input when nothing walkable is near.
    pub fn closest_valid_position(
        &self,
        pos: &LocationVector,
        max_distance: f64,
    ) -> LocationVector {
        if self.is_position_valid(pos) {
            return *pos;
        }
        let Some((cx, cy)) = self.clamped_cell(pos) else {
            return *pos;
        };
        let max_rings = (max_distance / self.cell_size).ceil() as i64;
        for ring in 0..=max_rings {
            let mut best: Option<(f64, usize, usize)> = None;
            for dy in -ring..=ring {
                for dx in -ring..=ring {
                    if dx.abs() != ring && dy.abs() != ring {
                        continue;
                    }
                    let nx = cx as i64 + dx;
                    let ny = cy as i64 + dy;
                    if nx < 0 || ny < 0 || nx >= self.width as i64 || ny >= self.height as i64 {
                        continue;
                    }
                    let (nx, ny) = (nx as usize, ny as usize);
                    if !self.walkable(nx, ny) {
                        continue;
                    }
                    let center = self.cell_center(nx, ny);
                    let dist = center.distance_2d(pos);
                    if dist <= max_distance
                        && best.map_or(true, |(best_dist, _, _)| dist < best_dist)
                    {
                        best = Some((dist, nx, ny));
                    }
                }
            }
            if let Some((_, nx, ny)) = best {
                let mut found = self.cell_center(nx, ny);
                found.z = pos.z;
                found.o = pos.o;
                return found;
            }
        }
        *pos
    }

    fn clamped_cell(&self, pos: &LocationVector) -> Option<(usize, usize)> {
        if self.width == 0 || self.height == 0 {
            return None;
        }
        let cx = ((pos.x - self.origin_x) / self.cell_size)
            .floor()
            .clamp(0.0, (self.width - 1) as f64) as usize;
        let cy = ((pos.y - self.origin_y) / self.cell_size)
            .floor()
            .clamp(0.0, (self.height - 1) as f64) as usize;
        Some((cx, cy))
    }

    /// A* over the grid with diagonal steps, then string-pulled through
    /// line-of-sight so straight stretches collapse to two waypoints.
    pub fn find_path(&self, start: &LocationVector, end: &LocationVector) -> Vec<LocationVector> {
        let (Some(start_cell), Some(end_cell)) = (self.cell_of(start), self.cell_of(end)) else {
            return Vec::new();
        };
        if !self.walkable(start_cell.0, start_cell.1) || !self.walkable(end_cell.0, end_cell.1) {
            return Vec::new();
        }
        if start_cell == end_cell {
            return vec![*start, *end];
        }

        const STRAIGHT: u32 = 10;
        const DIAGONAL: u32 = 14;
        let idx = |cx: usize, cy: usize| cy * self.width + cx;
        let heuristic = |cx: usize, cy: usize| {
            let dx = (cx as i64 - end_cell.0 as i64).unsigned_abs() as u32;
            let dy = (cy as i64 - end_cell.1 as i64).unsigned_abs() as u32;
            let (lo, hi) = if dx < dy { (dx, dy) } else { (dy, dx) };
            DIAGONAL * lo + STRAIGHT * (hi - lo)
        };

        let mut g_cost = vec![u32::MAX; self.cells.len()];
        let mut came_from = vec![usize::MAX; self.cells.len()];
        let mut open = BinaryHeap::new();
        g_cost[idx(start_cell.0, start_cell.1)] = 0;
        open.push(Reverse((
            heuristic(start_cell.0, start_cell.1),
            idx(start_cell.0, start_cell.1),
        )));

        while let Some(Reverse((_, current))) = open.pop() {
            let (cx, cy) = (current % self.width, current / self.width);
            if (cx, cy) == end_cell {
                break;
            }
            for (dx, dy, step) in [
                (-1i64, 0i64, STRAIGHT),
                (1, 0, STRAIGHT),
                (0, -1, STRAIGHT),
                (0, 1, STRAIGHT),
                (-1, -1, DIAGONAL),
                (1, -1, DIAGONAL),
                (-1, 1, DIAGONAL),
                (1, 1, DIAGONAL),
            ] {
                let nx = cx as i64 + dx;
                let ny = cy as i64 + dy;
                if nx < 0 || ny < 0 || nx >= self.width as i64 || ny >= self.height as i64 {
                    continue;
                }
                let (nx, ny) = (nx as usize, ny as usize);
                if !self.walkable(nx, ny) {
                    continue;
                }
                // Diagonal movement requires both adjacent cardinals open so
                // paths cannot clip corners.
                if dx != 0 && dy != 0 {
                    let (ax, ay) = ((cx as i64 + dx) as usize, cy);
                    let (bx, by) = (cx, (cy as i64 + dy) as usize);
                    if !self.walkable(ax, ay) || !self.walkable(bx, by) {
                        continue;
                    }
                }
                let tentative = g_cost[current].saturating_add(step);
                let neighbor = idx(nx, ny);
                if tentative < g_cost[neighbor] {
                    g_cost[neighbor] = tentative;
                    came_from[neighbor] = current;
                    open.push(Reverse((tentative + heuristic(nx, ny), neighbor)));
                }
            }
        }

        let end_idx = idx(end_cell.0, end_cell.1);
        if g_cost[end_idx] == u32::MAX {
            return Vec::new();
        }

        let mut cells = vec![end_idx];
        let mut cursor = end_idx;
        while cursor != idx(start_cell.0, start_cell.1) {
            cursor = came_from[cursor];
            cells.push(cursor);
        }
        cells.reverse();

        let mut waypoints: Vec<LocationVector> = cells
            .iter()
            .map(|&cell| self.cell_center(cell % self.width, cell / self.width))
            .collect();
        waypoints = self.simplify(waypoints);
        if let Some(first) = waypoints.first_mut() {
            *first = *start;
        }
        if let Some(last) = waypoints.last_mut() {
            *last = *end;
        }
        waypoints
    }

    pub fn path_distance(&self, start: &LocationVector, end: &LocationVector) -> Option<f64> {
        let path = self.find_path(start, end);
        if path.is_empty() {
            return None;
        }
        Some(
            path.windows(2)
                .map(|pair| pair[0].distance_2d(&pair[1]))
                .sum(),
        )
    }

    fn simplify(&self, path: Vec<LocationVector>) -> Vec<LocationVector> {
        if path.len() <= 2 {
            return path;
        }
        let mut out = vec![path[0]];
        let mut anchor = 0;
        for i in 1..path.len() {
            if i + 1 == path.len() || !self.has_line_of_sight(&path[anchor], &path[i + 1]) {
                out.push(path[i]);
                anchor = i;
            }
        }
        out
    }

    /// Samples the segment at half-cell steps; every sample must land on a
    /// walkable cell.
    pub fn has_line_of_sight(&self, a: &LocationVector, b: &LocationVector) -> bool {
        if !self.is_position_valid(a) || !self.is_position_valid(b) {
            return false;
        }
        let length = a.distance_2d(b);
        let step = self.cell_size * 0.5;
        let samples = (length / step).ceil() as usize;
        for i in 1..samples {
            let t = i as f64 / samples as f64;
            let probe = LocationVector::new(
                a.x + (b.x - a.x) * t,
                a.y + (b.y - a.y) * t,
                0.0,
            );
            if !self.is_position_valid(&probe) {
                return false;
            }
        }
        true
    }

    /// Uniform sample of a walkable point within `radius` of `center`;
    /// returns the center when the disc holds nothing walkable.
    pub fn random_point(&self, center: &LocationVector, radius: f64) -> LocationVector {
        let mut rng = rand::thread_rng();
        for _ in 0..32 {
            let angle = rng.gen_range(0.0..std::f64::consts::TAU);
            let dist = radius * rng.gen_range(0.0f64..1.0).sqrt();
            let candidate = LocationVector::new(
                center.x + dist * angle.cos(),
                center.y + dist * angle.sin(),
                center.z,
            );
            if self.is_position_valid(&candidate) {
                return candidate;
            }
        }
        *center
    }
}

fn parse_usize(value: &str, label: &str, line_no: usize) -> Result<usize, String> {
    value
        .parse::<usize>()
        .map_err(|_| format!("{} expects unsigned int at line {}, got '{}'", label, line_no, value))
}

fn parse_f64(value: &str, label: &str, line_no: usize) -> Result<f64, String> {
    value
        .parse::<f64>()
        .map_err(|_| format!("{} expects number at line {}, got '{}'", label, line_no, value))
}

/// Per-district mesh registry. Populated once at startup; lookups are
/// lock-free afterwards.
#[derive(Debug, Default)]
pub struct NavMeshService {
    meshes: HashMap<u8, NavMesh>,
}

impl NavMeshService {
    pub fn new() -> Self {
        Self {
            meshes: HashMap::new(),
        }
    }

    pub fn insert(&mut self, district: u8, mesh: NavMesh) {
        self.meshes.insert(district, mesh);
    }

    pub fn is_loaded(&self, district: u8) -> bool {
        self.meshes.contains_key(&district)
    }

    pub fn mesh(&self, district: u8) -> Option<&NavMesh> {
        self.meshes.get(&district)
    }

    pub fn find_path(
        &self,
        district: u8,
        start: &LocationVector,
        end: &LocationVector,
    ) -> Vec<LocationVector> {
        match self.meshes.get(&district) {
            Some(mesh) => mesh.find_path(start, end),
            None => vec![*start, *end],
        }
    }

    pub fn find_path_bounded(
        &self,
        district: u8,
        start: &LocationVector,
        end: &LocationVector,
        max_path_length: f64,
    ) -> Vec<LocationVector> {
        let path = self.find_path(district, start, end);
        let length: f64 = path
            .windows(2)
            .map(|pair| pair[0].distance_2d(&pair[1]))
            .sum();
        if length > max_path_length {
            return Vec::new();
        }
        path
    }

    pub fn is_position_valid(&self, district: u8, pos: &LocationVector) -> bool {
        match self.meshes.get(&district) {
            Some(mesh) => mesh.is_position_valid(pos),
            None => true,
        }
    }

    pub fn closest_valid_position(
        &self,
        district: u8,
        pos: &LocationVector,
        max_distance: f64,
    ) -> LocationVector {
        match self.meshes.get(&district) {
            Some(mesh) => mesh.closest_valid_position(pos, max_distance),
            None => *pos,
        }
    }

    pub fn path_distance(
        &self,
        district: u8,
        start: &LocationVector,
        end: &LocationVector,
    ) -> Option<f64> {
        match self.meshes.get(&district) {
            Some(mesh) => mesh.path_distance(start, end),
            None => Some(start.distance_2d(end)),
        }
    }

    pub fn has_line_of_sight(
        &self,
        district: u8,
        start: &LocationVector,
        end: &LocationVector,
    ) -> bool {
        match self.meshes.get(&district) {
            Some(mesh) => mesh.has_line_of_sight(start, end),
            None => true,
        }
    }

    pub fn random_point(
        &self,
        district: u8,
        center: &LocationVector,
        radius: f64,
    ) -> LocationVector {
        match self.meshes.get(&district) {
            Some(mesh) => mesh.random_point(center, radius),
            None => *center,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CORRIDOR: &str = "\
width=8
height=5
cell=1
rows
........
.######.
.######.
.######.
........
";

    fn corridor() -> NavMesh {
        NavMesh::parse(CORRIDOR).expect("mesh")
    }

    #[test]
    fn parse_rejects_bad_rows() {
        let err = NavMesh::parse("width=2\nheight=2\nrows\n..\n.").unwrap_err();
        assert!(err.contains("row 2"));
    }

    #[test]
    fn validity_matches_grid() {
        let mesh = corridor();
        assert!(mesh.is_position_valid(&LocationVector::new(0.5, 0.5, 0.0)));
        assert!(!mesh.is_position_valid(&LocationVector::new(2.5, 2.5, 0.0)));
        assert!(!mesh.is_position_valid(&LocationVector::new(-1.0, 0.5, 0.0)));
        assert!(!mesh.is_position_valid(&LocationVector::new(9.0, 0.5, 0.0)));
    }

    #[test]
    fn closest_valid_position_snaps_out_of_walls() {
        let mesh = corridor();
        let inside_wall = LocationVector::new(2.5, 2.5, 0.0);
        let snapped = mesh.closest_valid_position(&inside_wall, 5.0);
        assert!(mesh.is_position_valid(&snapped));
        assert!(snapped.distance_2d(&inside_wall) <= 5.0);
    }

    #[test]
    fn path_goes_around_the_block() {
        let mesh = corridor();
        let start = LocationVector::new(0.5, 2.5, 0.0);
        let end = LocationVector::new(7.5, 2.5, 0.0);
        let path = mesh.find_path(&start, &end);
        assert!(path.len() >= 3, "path should bend around the wall");
        assert_eq!(path[0], start);
        assert_eq!(*path.last().expect("end"), end);
        for pair in path.windows(2) {
            assert!(mesh.has_line_of_sight(&pair[0], &pair[1]));
        }
        let direct = start.distance_2d(&end);
        let length: f64 = path.windows(2).map(|p| p[0].distance_2d(&p[1])).sum();
        assert!(length > direct);
    }

    #[test]
    fn path_fails_when_target_is_blocked() {
        let mesh = corridor();
        let start = LocationVector::new(0.5, 0.5, 0.0);
        let blocked = LocationVector::new(3.5, 2.5, 0.0);
        assert!(mesh.find_path(&start, &blocked).is_empty());
        assert_eq!(mesh.path_distance(&start, &blocked), None);
    }

    #[test]
    fn line_of_sight_blocked_by_wall() {
        let mesh = corridor();
        let left = LocationVector::new(0.5, 2.5, 0.0);
        let right = LocationVector::new(7.5, 2.5, 0.0);
        assert!(!mesh.has_line_of_sight(&left, &right));
        let top_left = LocationVector::new(0.5, 0.5, 0.0);
        let top_right = LocationVector::new(7.5, 0.5, 0.0);
        assert!(mesh.has_line_of_sight(&top_left, &top_right));
    }

    #[test]
    fn random_point_is_walkable() {
        let mesh = corridor();
        let center = LocationVector::new(0.5, 0.5, 0.0);
        for _ in 0..16 {
            let point = mesh.random_point(&center, 3.0);
            assert!(mesh.is_position_valid(&point));
            assert!(point.distance_2d(&center) <= 3.0 + 1e-9);
        }
    }

    #[test]
    fn open_grid_is_walkable_everywhere_inside_bounds() {
        let mesh = NavMesh::open(4, 4, 2.0, -4.0, -4.0);
        assert!(mesh.is_position_valid(&LocationVector::new(-3.0, -3.0, 0.0)));
        assert!(mesh.is_position_valid(&LocationVector::new(3.0, 3.0, 0.0)));
        assert!(!mesh.is_position_valid(&LocationVector::new(5.0, 0.0, 0.0)));
        let path = mesh.find_path(
            &LocationVector::new(-3.0, -3.0, 0.0),
            &LocationVector::new(3.0, 3.0, 0.0),
        );
        assert_eq!(path.len(), 2);
    }

    #[test]
    fn service_falls_back_to_open_world() {
        let service = NavMeshService::new();
        let a = LocationVector::new(0.0, 0.0, 0.0);
        let b = LocationVector::new(10.0, 0.0, 0.0);
        assert!(service.is_position_valid(9, &a));
        assert!(service.has_line_of_sight(9, &a, &b));
        assert_eq!(service.find_path(9, &a, &b), vec![a, b]);
    }

    #[test]
    fn bounded_path_rejects_long_routes() {
        let mut service = NavMeshService::new();
        service.insert(1, corridor());
        let start = LocationVector::new(0.5, 2.5, 0.0);
        let end = LocationVector::new(7.5, 2.5, 0.0);
        assert!(service.find_path_bounded(1, &start, &end, 2.0).is_empty());
        assert!(!service.find_path_bounded(1, &start, &end, 50.0).is_empty());
    }
}
