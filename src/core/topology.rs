//! Layer topology declarations and the connection graph builder.
//!
//! A layer's wiring is a list of [`Connection`]s per output neuron. Each connection names
//! its source (a previous-layer neuron or the bias unit) and the weight slot it reads.
//! Convolutional layers tie one kernel across every spatial position of a map, so many
//! connections share one weight index; local layers give every position its own block.
//!
//! ## Weight layouts
//!
//! ```text
//! fully connected  neuron y: [bias, w_0 .. w_{P-1}] at y*(P+1)
//! convolutional    [bias_0 .. bias_{M-1}] then one rf-sized kernel per connected map pair
//! local            one (rf+1)-sized block per (map pair, position), bias first
//! pooling          [bias, scale] per map at 2*map
//! ```

use rand::Rng;
use rand_chacha::rand_core::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::path::Path;

use super::network::OutputRange;
use super::{Activation, NetError, NetResult};

/// The kind of a layer, which selects its wiring and its compute/backprop strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LayerKind {
    Input,
    FullyConnected,
    Convolutional,
    Local,
    MaxPooling,
    AvgPooling,
}

impl LayerKind {
    /// Whether layers of this kind own trainable weights.
    pub fn has_weights(self) -> bool {
        !matches!(self, LayerKind::Input)
    }
}

/// Feature-map geometry of a layer: `maps` planes of `width × height` neurons.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MapGeometry {
    #[serde(alias = "neurons")]
    pub maps: usize,
    #[serde(default = "one")]
    pub width: usize,
    #[serde(default = "one")]
    pub height: usize,
}

impl MapGeometry {
    pub fn new(maps: usize, width: usize, height: usize) -> Self {
        Self {
            maps,
            width,
            height,
        }
    }

    /// Neurons per map.
    pub fn map_size(&self) -> usize {
        self.width * self.height
    }

    pub fn neuron_count(&self) -> usize {
        self.maps * self.map_size()
    }
}

/// A horizontal/vertical pair, used for receptive fields, strides and padding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Window {
    pub x: usize,
    pub y: usize,
}

impl Window {
    pub fn new(x: usize, y: usize) -> Self {
        Self { x, y }
    }

    pub fn unit() -> Self {
        Self::new(1, 1)
    }

    pub fn zero() -> Self {
        Self::new(0, 0)
    }

    pub fn area(&self) -> usize {
        self.x * self.y
    }
}

fn one() -> usize {
    1
}

fn yes() -> bool {
    true
}

/// Boolean connectivity between previous-layer maps and current-layer maps, stored
/// row-major as `[prev_map * current_map_count + current_map]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Mapping {
    connected: Vec<bool>,
}

impl Mapping {
    pub fn new(connected: Vec<bool>) -> Self {
        Self { connected }
    }

    /// Random sparse mapping: each pair is connected when a uniform draw in `[0, 100)` falls
    /// below `density`. The same seed always yields the same mapping.
    ///
    /// # Errors
    /// - `Configuration` if either map count is zero
    pub fn random(
        previous_maps: usize,
        current_maps: usize,
        density: u32,
        seed: u64,
    ) -> NetResult<Self> {
        if previous_maps == 0 || current_maps == 0 {
            return Err(NetError::Configuration(
                "random mapping needs at least one map on each side".to_string(),
            ));
        }
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let connected = (0..previous_maps * current_maps)
            .map(|_| rng.gen_range(0..100) < density)
            .collect();
        Ok(Self { connected })
    }

    pub fn is_mapped(&self, previous_map: usize, current_map: usize, current_maps: usize) -> bool {
        self.connected[previous_map * current_maps + current_map]
    }

    pub fn len(&self) -> usize {
        self.connected.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connected.is_empty()
    }

    /// Number of connected map pairs.
    pub fn connected_count(&self) -> usize {
        self.connected.iter().filter(|&&c| c).count()
    }
}

/// Declaration of one layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerSpec {
    pub kind: LayerKind,
    #[serde(default)]
    pub activation: Activation,
    #[serde(flatten)]
    pub geometry: MapGeometry,
    #[serde(default = "Window::unit")]
    pub receptive_field: Window,
    #[serde(default = "Window::unit")]
    pub stride: Window,
    #[serde(default = "Window::zero")]
    pub pad: Window,
    /// When false, `mapping` must describe which map pairs are connected.
    #[serde(default = "yes")]
    pub fully_mapped: bool,
    #[serde(default)]
    pub mapping: Option<Mapping>,
    /// Overrides the network-wide learning rate for this layer.
    #[serde(default)]
    pub learning_rate: Option<f64>,
    /// Overrides the network-wide momentum for this layer.
    #[serde(default)]
    pub momentum: Option<f64>,
}

impl LayerSpec {
    fn with_kind(kind: LayerKind, activation: Activation, geometry: MapGeometry) -> Self {
        Self {
            kind,
            activation,
            geometry,
            receptive_field: Window::unit(),
            stride: Window::unit(),
            pad: Window::zero(),
            fully_mapped: true,
            mapping: None,
            learning_rate: None,
            momentum: None,
        }
    }

    /// Plain input buffer of `maps` planes.
    pub fn input(maps: usize, width: usize, height: usize) -> Self {
        Self::with_kind(
            LayerKind::Input,
            Activation::None,
            MapGeometry::new(maps, width, height),
        )
    }

    /// Dense layer of `neurons` outputs, each a 1×1 map.
    pub fn fully_connected(activation: Activation, neurons: usize) -> Self {
        Self::with_kind(
            LayerKind::FullyConnected,
            activation,
            MapGeometry::new(neurons, 1, 1),
        )
    }

    /// Weight-tied convolution over the padded previous maps.
    pub fn convolutional(
        activation: Activation,
        geometry: MapGeometry,
        receptive_field: Window,
    ) -> Self {
        let mut spec = Self::with_kind(LayerKind::Convolutional, activation, geometry);
        spec.receptive_field = receptive_field;
        spec
    }

    /// Locally-connected layer: convolution wiring without weight tying.
    pub fn local(activation: Activation, geometry: MapGeometry, receptive_field: Window) -> Self {
        let mut spec = Self::with_kind(LayerKind::Local, activation, geometry);
        spec.receptive_field = receptive_field;
        spec
    }

    pub fn max_pooling(
        activation: Activation,
        geometry: MapGeometry,
        receptive_field: Window,
        stride: Window,
    ) -> Self {
        let mut spec = Self::with_kind(LayerKind::MaxPooling, activation, geometry);
        spec.receptive_field = receptive_field;
        spec.stride = stride;
        spec
    }

    pub fn avg_pooling(
        activation: Activation,
        geometry: MapGeometry,
        receptive_field: Window,
        stride: Window,
    ) -> Self {
        let mut spec = Self::with_kind(LayerKind::AvgPooling, activation, geometry);
        spec.receptive_field = receptive_field;
        spec.stride = stride;
        spec
    }

    pub fn with_stride(mut self, x: usize, y: usize) -> Self {
        self.stride = Window::new(x, y);
        self
    }

    pub fn with_padding(mut self, x: usize, y: usize) -> Self {
        self.pad = Window::new(x, y);
        self
    }

    /// Connect only the map pairs marked in `mapping`.
    pub fn with_mapping(mut self, mapping: Mapping) -> Self {
        self.fully_mapped = false;
        self.mapping = Some(mapping);
        self
    }

    pub fn with_learning_rate(mut self, learning_rate: f64) -> Self {
        self.learning_rate = Some(learning_rate);
        self
    }

    pub fn with_momentum(mut self, momentum: f64) -> Self {
        self.momentum = Some(momentum);
        self
    }
}

/// A whole network declaration, loadable from JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Topology {
    pub name: String,
    pub class_count: usize,
    #[serde(default)]
    pub range: OutputRange,
    pub layers: Vec<LayerSpec>,
}

impl Topology {
    /// Read a topology from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_json_file(path: &Path) -> NetResult<Self> {
        let json = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&json)?)
    }
}

/// Where a connection takes its input from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Source {
    /// The implicit unit-valued bias input.
    Bias,
    /// A neuron of the previous layer.
    Neuron(usize),
}

/// One input of a neuron: its source and the weight slot it reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Connection {
    pub source: Source,
    pub weight: usize,
}

impl Connection {
    pub fn bias(weight: usize) -> Self {
        Self {
            source: Source::Bias,
            weight,
        }
    }

    pub fn neuron(index: usize, weight: usize) -> Self {
        Self {
            source: Source::Neuron(index),
            weight,
        }
    }
}

/// Compressed inverse index: for each key (a weight slot or a previous neuron), the
/// `(neuron, slot)` pairs of the connections that reference it, in ascending order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Incidence {
    offsets: Vec<usize>,
    entries: Vec<(usize, usize)>,
}

impl Incidence {
    fn build(
        key_count: usize,
        connections: &[Vec<Connection>],
        key_of: impl Fn(&Connection) -> Option<usize>,
    ) -> Self {
        let mut offsets = vec![0usize; key_count + 1];
        for list in connections {
            for key in list.iter().filter_map(&key_of) {
                offsets[key + 1] += 1;
            }
        }
        for k in 0..key_count {
            offsets[k + 1] += offsets[k];
        }

        let mut cursor = offsets.clone();
        let mut entries = vec![(0usize, 0usize); offsets[key_count]];
        for (neuron, list) in connections.iter().enumerate() {
            for (slot, connection) in list.iter().enumerate() {
                if let Some(key) = key_of(connection) {
                    entries[cursor[key]] = (neuron, slot);
                    cursor[key] += 1;
                }
            }
        }

        Self { offsets, entries }
    }

    /// References to `key`.
    #[inline]
    pub fn get(&self, key: usize) -> &[(usize, usize)] {
        &self.entries[self.offsets[key]..self.offsets[key + 1]]
    }

    pub fn key_count(&self) -> usize {
        self.offsets.len().saturating_sub(1)
    }

    /// Total number of references.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Output of the graph builder for one layer.
#[derive(Debug, Clone, Default)]
pub struct ConnectionGraph {
    /// Per output neuron, bias connection first.
    pub connections: Vec<Vec<Connection>>,
    pub weight_count: usize,
    /// Weight slot -> referencing connections.
    pub weight_refs: Incidence,
    /// Previous-layer neuron -> connections reading it.
    pub source_refs: Incidence,
}

impl ConnectionGraph {
    fn new(connections: Vec<Vec<Connection>>, weight_count: usize, previous_count: usize) -> Self {
        let weight_refs = Incidence::build(weight_count, &connections, |c| Some(c.weight));
        let source_refs = Incidence::build(previous_count, &connections, |c| match c.source {
            Source::Neuron(n) => Some(n),
            Source::Bias => None,
        });
        Self {
            connections,
            weight_count,
            weight_refs,
            source_refs,
        }
    }

    /// Total number of connections across all neurons.
    pub fn connection_count(&self) -> usize {
        self.connections.iter().map(Vec::len).sum()
    }
}

/// Build the connection graph of a layer declared by `spec` on top of a previous layer
/// with geometry `previous`.
///
/// # Errors
/// - `Configuration` for zero-sized geometry, an output geometry that does not fit the
///   padded input, an invalid or missing mapping, mismatched pooling maps, or a pooling
///   window that lies entirely outside the previous map
pub fn build_graph(spec: &LayerSpec, previous: &MapGeometry) -> NetResult<ConnectionGraph> {
    check_geometry(&spec.geometry, "layer")?;
    match spec.kind {
        LayerKind::Input => Ok(ConnectionGraph::default()),
        LayerKind::FullyConnected => {
            check_geometry(previous, "previous layer")?;
            Ok(fully_connected(
                previous.neuron_count(),
                spec.geometry.neuron_count(),
            ))
        }
        LayerKind::Convolutional | LayerKind::Local => {
            check_geometry(previous, "previous layer")?;
            windowed(spec, previous)
        }
        LayerKind::MaxPooling | LayerKind::AvgPooling => {
            check_geometry(previous, "previous layer")?;
            pooling(spec, previous)
        }
    }
}

fn check_geometry(geometry: &MapGeometry, what: &str) -> NetResult<()> {
    if geometry.neuron_count() == 0 {
        return Err(NetError::Configuration(format!(
            "{what} geometry {}x{}x{} has no neurons",
            geometry.maps, geometry.width, geometry.height
        )));
    }
    Ok(())
}

fn fully_connected(previous_count: usize, neuron_count: usize) -> ConnectionGraph {
    let block = previous_count + 1;
    let connections = (0..neuron_count)
        .map(|y| {
            let mut list = Vec::with_capacity(block);
            list.push(Connection::bias(y * block));
            list.extend((0..previous_count).map(|x| Connection::neuron(x, y * block + x + 1)));
            list
        })
        .collect();
    ConnectionGraph::new(connections, neuron_count * block, previous_count)
}

/// Ordinal of each connected (current map, previous map) pair in current-map-major order,
/// indexed `[current_map * previous_maps + previous_map]`.
fn mapping_ordinals(spec: &LayerSpec, previous: &MapGeometry) -> NetResult<Vec<Option<usize>>> {
    let current_maps = spec.geometry.maps;
    let pairs = previous.maps * current_maps;

    if spec.fully_mapped {
        if spec.mapping.is_some() {
            return Err(NetError::Configuration(
                "mapping given for a fully mapped layer".to_string(),
            ));
        }
        return Ok((0..pairs).map(Some).collect());
    }

    let mapping = spec.mapping.as_ref().ok_or_else(|| {
        NetError::Configuration("empty mappings definition".to_string())
    })?;
    if mapping.len() != pairs {
        return Err(NetError::Configuration(format!(
            "invalid mappings definition: {} entries for {} x {} maps",
            mapping.len(),
            previous.maps,
            current_maps
        )));
    }

    let mut ordinals = vec![None; pairs];
    let mut next = 0;
    for current_map in 0..current_maps {
        for previous_map in 0..previous.maps {
            if mapping.is_mapped(previous_map, current_map, current_maps) {
                ordinals[current_map * previous.maps + previous_map] = Some(next);
                next += 1;
            }
        }
    }
    Ok(ordinals)
}

fn windowed(spec: &LayerSpec, previous: &MapGeometry) -> NetResult<ConnectionGraph> {
    let geometry = spec.geometry;
    let rf = spec.receptive_field;
    let stride = spec.stride;
    let pad = spec.pad;

    if rf.area() == 0 || stride.area() == 0 {
        return Err(NetError::Configuration(
            "receptive field and stride must be at least 1x1".to_string(),
        ));
    }

    let mask_width = previous.width + 2 * pad.x;
    let mask_height = previous.height + 2 * pad.y;
    let mask_size = mask_width * mask_height;
    if (geometry.width - 1) * stride.x + rf.x > mask_width
        || (geometry.height - 1) * stride.y + rf.y > mask_height
    {
        return Err(NetError::Configuration(format!(
            "{}x{} output with {}x{} field and {}x{} stride does not fit a {}x{} padded input",
            geometry.width,
            geometry.height,
            rf.x,
            rf.y,
            stride.x,
            stride.y,
            mask_width,
            mask_height
        )));
    }

    // Padded index mask: `None` marks padding, otherwise the real previous neuron.
    let mut mask = vec![None; mask_size * previous.maps];
    for map in 0..previous.maps {
        for y in 0..previous.height {
            for x in 0..previous.width {
                mask[(x + pad.x) + (y + pad.y) * mask_width + map * mask_size] =
                    Some(x + y * previous.width + map * previous.map_size());
            }
        }
    }

    let ordinals = mapping_ordinals(spec, previous)?;
    let total_mappings = ordinals.iter().flatten().count();
    let rf_size = rf.area();
    let map_size = geometry.map_size();
    let tied = spec.kind == LayerKind::Convolutional;

    for current_map in 0..geometry.maps {
        let row = &ordinals[current_map * previous.maps..(current_map + 1) * previous.maps];
        if row.iter().all(Option::is_none) {
            return Err(NetError::Configuration(format!(
                "output map {current_map} is not connected to any input map"
            )));
        }
    }

    let weight_count = if tied {
        total_mappings * rf_size + geometry.maps
    } else {
        total_mappings * map_size * (rf_size + 1)
    };

    let connections = (0..geometry.neuron_count())
        .into_par_iter()
        .map(|position| {
            let current_map = position / map_size;
            let local = position % map_size;
            let (x, y) = (local % geometry.width, local / geometry.width);

            let mut list = Vec::with_capacity(1 + previous.maps * rf_size);
            let mut bias = tied.then_some(current_map);
            list.push(Connection::bias(0));

            for previous_map in 0..previous.maps {
                let Some(ordinal) = ordinals[current_map * previous.maps + previous_map] else {
                    continue;
                };
                let base = if tied {
                    geometry.maps + ordinal * rf_size
                } else {
                    let block = (ordinal * map_size + local) * (rf_size + 1);
                    bias.get_or_insert(block);
                    block + 1
                };
                for row in 0..rf.y {
                    for column in 0..rf.x {
                        let cell = (x * stride.x + column)
                            + (y * stride.y + row) * mask_width
                            + previous_map * mask_size;
                        if let Some(source) = mask[cell] {
                            list.push(Connection::neuron(source, base + row * rf.x + column));
                        }
                    }
                }
            }

            // every output map has at least one mapping, so a bias slot always exists
            list[0] = Connection::bias(bias.unwrap_or(0));
            list
        })
        .collect();

    Ok(ConnectionGraph::new(
        connections,
        weight_count,
        previous.neuron_count(),
    ))
}

fn pooling(spec: &LayerSpec, previous: &MapGeometry) -> NetResult<ConnectionGraph> {
    let geometry = spec.geometry;
    let rf = spec.receptive_field;
    let stride = spec.stride;

    if previous.maps != geometry.maps {
        return Err(NetError::Configuration(format!(
            "pooling needs one input map per output map ({} vs {})",
            previous.maps, geometry.maps
        )));
    }
    if rf.area() == 0 || stride.area() == 0 {
        return Err(NetError::Configuration(
            "receptive field and stride must be at least 1x1".to_string(),
        ));
    }

    // Non-overlapping blocks when the field tiles the stride, centered windows otherwise.
    let centered = rf.area() != stride.area();
    let (rows, columns): (Vec<isize>, Vec<isize>) = if centered {
        let (r_mid, c_mid) = ((rf.y / 2) as isize, (rf.x / 2) as isize);
        ((-r_mid..=r_mid).collect(), (-c_mid..=c_mid).collect())
    } else {
        ((0..rf.y as isize).collect(), (0..rf.x as isize).collect())
    };

    let map_size = geometry.map_size();
    let mut connections = Vec::with_capacity(geometry.neuron_count());
    for position in 0..geometry.neuron_count() {
        let map = position / map_size;
        let local = position % map_size;
        let (x, y) = (local % geometry.width, local / geometry.width);

        let mut list = vec![Connection::bias(2 * map)];
        for &row in &rows {
            for &column in &columns {
                let py = (y * stride.y) as isize + row;
                let px = (x * stride.x) as isize + column;
                if py < 0 || px < 0 {
                    continue;
                }
                let (px, py) = (px as usize, py as usize);
                if px >= previous.width || py >= previous.height {
                    continue;
                }
                list.push(Connection::neuron(
                    px + py * previous.width + map * previous.map_size(),
                    2 * map + 1,
                ));
            }
        }

        if list.len() == 1 {
            return Err(NetError::Configuration(format!(
                "pooling window of neuron {position} lies outside the previous map"
            )));
        }
        connections.push(list);
    }

    Ok(ConnectionGraph::new(
        connections,
        2 * geometry.maps,
        previous.neuron_count(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bias_count(list: &[Connection]) -> usize {
        list.iter().filter(|c| c.source == Source::Bias).count()
    }

    fn all_weights_reachable(graph: &ConnectionGraph) -> bool {
        (0..graph.weight_count).all(|w| !graph.weight_refs.get(w).is_empty())
    }

    #[test]
    fn test_fully_connected_counts() {
        let previous = MapGeometry::new(4, 1, 1);
        let spec = LayerSpec::fully_connected(Activation::Tanh, 3);
        let graph = build_graph(&spec, &previous).unwrap();

        assert_eq!(graph.weight_count, 3 * (4 + 1));
        for (y, list) in graph.connections.iter().enumerate() {
            assert_eq!(list.len(), 5);
            assert_eq!(bias_count(list), 1);
            assert_eq!(list[0], Connection::bias(y * 5));
            assert_eq!(list[3], Connection::neuron(2, y * 5 + 3));
        }
        assert!(all_weights_reachable(&graph));
    }

    #[test]
    fn test_convolution_weight_count_is_size_independent() {
        for &size in &[3usize, 6, 11] {
            let previous = MapGeometry::new(2, size + 2, size + 2);
            let spec = LayerSpec::convolutional(
                Activation::Tanh,
                MapGeometry::new(4, size, size),
                Window::new(3, 3),
            );
            let graph = build_graph(&spec, &previous).unwrap();
            assert_eq!(graph.weight_count, 2 * 4 * 9 + 4);
            assert!(all_weights_reachable(&graph));
            for list in &graph.connections {
                assert_eq!(bias_count(list), 1);
                assert_eq!(list.len(), 1 + 2 * 9);
            }
        }
    }

    #[test]
    fn test_convolution_ties_weights_across_positions() {
        let previous = MapGeometry::new(1, 4, 4);
        let spec = LayerSpec::convolutional(
            Activation::Tanh,
            MapGeometry::new(1, 2, 2),
            Window::new(3, 3),
        );
        let graph = build_graph(&spec, &previous).unwrap();

        let first: Vec<usize> = graph.connections[0].iter().map(|c| c.weight).collect();
        for list in &graph.connections[1..] {
            let weights: Vec<usize> = list.iter().map(|c| c.weight).collect();
            assert_eq!(weights, first);
        }
        // each kernel cell is read by all four positions
        assert_eq!(graph.weight_refs.get(1).len(), 4);
    }

    #[test]
    fn test_convolution_padding_omits_cells() {
        let previous = MapGeometry::new(1, 3, 3);
        let spec =
            LayerSpec::convolutional(Activation::Tanh, MapGeometry::new(1, 3, 3), Window::new(3, 3))
                .with_padding(1, 1);
        let graph = build_graph(&spec, &previous).unwrap();

        // corner sees a 2x2 patch, edge 2x3, center the full 3x3
        assert_eq!(graph.connections[0].len(), 1 + 4);
        assert_eq!(graph.connections[1].len(), 1 + 6);
        assert_eq!(graph.connections[4].len(), 1 + 9);
        // top-left corner's first real cell is kernel cell (1,1)
        assert_eq!(graph.connections[0][1], Connection::neuron(0, 1 + 4));
    }

    #[test]
    fn test_convolution_stride() {
        let previous = MapGeometry::new(1, 5, 5);
        let spec =
            LayerSpec::convolutional(Activation::Tanh, MapGeometry::new(1, 2, 2), Window::new(3, 3))
                .with_stride(2, 2);
        let graph = build_graph(&spec, &previous).unwrap();
        // second output column starts two pixels to the right
        assert_eq!(graph.connections[1][1].source, Source::Neuron(2));
        assert_eq!(graph.connections[2][1].source, Source::Neuron(10));
    }

    #[test]
    fn test_convolution_geometry_must_fit() {
        let previous = MapGeometry::new(1, 4, 4);
        let spec = LayerSpec::convolutional(
            Activation::Tanh,
            MapGeometry::new(1, 3, 3),
            Window::new(3, 3),
        );
        assert!(matches!(
            build_graph(&spec, &previous),
            Err(NetError::Configuration(_))
        ));
    }

    #[test]
    fn test_selective_mapping() {
        let previous = MapGeometry::new(2, 3, 3);
        // prev 0 -> cur 0, prev 1 -> cur 0 and cur 1
        let mapping = Mapping::new(vec![true, false, true, true]);
        let spec =
            LayerSpec::convolutional(Activation::Tanh, MapGeometry::new(2, 1, 1), Window::new(3, 3))
                .with_mapping(mapping);
        let graph = build_graph(&spec, &previous).unwrap();

        assert_eq!(graph.weight_count, 3 * 9 + 2);
        assert_eq!(graph.connections[0].len(), 1 + 18);
        assert_eq!(graph.connections[1].len(), 1 + 9);
        // map 1 reads only previous map 1 with the third kernel
        assert_eq!(graph.connections[1][1], Connection::neuron(9, 2 + 2 * 9));
        assert!(all_weights_reachable(&graph));
    }

    #[test]
    fn test_invalid_mapping_length() {
        let previous = MapGeometry::new(2, 3, 3);
        let spec =
            LayerSpec::convolutional(Activation::Tanh, MapGeometry::new(2, 1, 1), Window::new(3, 3))
                .with_mapping(Mapping::new(vec![true, false, true]));
        assert!(matches!(
            build_graph(&spec, &previous),
            Err(NetError::Configuration(_))
        ));
    }

    #[test]
    fn test_missing_mapping() {
        let previous = MapGeometry::new(2, 3, 3);
        let mut spec =
            LayerSpec::local(Activation::Tanh, MapGeometry::new(2, 1, 1), Window::new(3, 3));
        spec.fully_mapped = false;
        let err = build_graph(&spec, &previous).unwrap_err();
        assert!(err.to_string().contains("empty mappings"));
    }

    #[test]
    fn test_unconnected_output_map() {
        let previous = MapGeometry::new(1, 3, 3);
        let spec =
            LayerSpec::convolutional(Activation::Tanh, MapGeometry::new(2, 1, 1), Window::new(3, 3))
                .with_mapping(Mapping::new(vec![true, false]));
        assert!(build_graph(&spec, &previous).is_err());
    }

    #[test]
    fn test_local_layer_has_private_weights() {
        let previous = MapGeometry::new(1, 4, 4);
        let spec = LayerSpec::local(Activation::Tanh, MapGeometry::new(2, 2, 2), Window::new(3, 3));
        let graph = build_graph(&spec, &previous).unwrap();

        assert_eq!(graph.weight_count, 2 * 4 * (9 + 1));
        assert!(all_weights_reachable(&graph));
        for w in 0..graph.weight_count {
            assert_eq!(graph.weight_refs.get(w).len(), 1);
        }
        for (position, list) in graph.connections.iter().enumerate() {
            assert_eq!(list[0], Connection::bias(position * 10));
        }
    }

    #[test]
    fn test_local_layer_uses_first_block_bias() {
        let previous = MapGeometry::new(2, 3, 3);
        let spec = LayerSpec::local(Activation::Tanh, MapGeometry::new(1, 1, 1), Window::new(3, 3));
        let graph = build_graph(&spec, &previous).unwrap();

        assert_eq!(graph.weight_count, 2 * (9 + 1));
        assert_eq!(graph.connections[0][0], Connection::bias(0));
        assert_eq!(graph.connections[0].len(), 1 + 2 * 9);
        // the second block's bias slot is allocated but never read
        let unreachable: Vec<usize> = (0..graph.weight_count)
            .filter(|&w| graph.weight_refs.get(w).is_empty())
            .collect();
        assert_eq!(unreachable, vec![10]);
    }

    #[test]
    fn test_block_pooling() {
        let previous = MapGeometry::new(2, 4, 4);
        let spec = LayerSpec::max_pooling(
            Activation::Identity,
            MapGeometry::new(2, 2, 2),
            Window::new(2, 2),
            Window::new(2, 2),
        );
        let graph = build_graph(&spec, &previous).unwrap();

        assert_eq!(graph.weight_count, 4);
        let sources: Vec<Source> = graph.connections[5].iter().map(|c| c.source).collect();
        // map 1, output (1,0) covers previous (2..4, 0..2) of map 1
        assert_eq!(
            sources,
            vec![
                Source::Bias,
                Source::Neuron(18),
                Source::Neuron(19),
                Source::Neuron(22),
                Source::Neuron(23)
            ]
        );
        assert!(graph.connections[5][1..].iter().all(|c| c.weight == 3));
        assert_eq!(graph.connections[5][0].weight, 2);
    }

    #[test]
    fn test_centered_pooling_truncates_at_borders() {
        let previous = MapGeometry::new(1, 4, 4);
        let spec = LayerSpec::avg_pooling(
            Activation::Identity,
            MapGeometry::new(1, 2, 2),
            Window::new(3, 3),
            Window::new(2, 2),
        );
        let graph = build_graph(&spec, &previous).unwrap();
        // centered on (0,0): only the 2x2 lower-right quarter is inside
        assert_eq!(graph.connections[0].len(), 1 + 4);
        // centered on (2,2): full window
        assert_eq!(graph.connections[3].len(), 1 + 9);
    }

    #[test]
    fn test_pooling_map_count_must_match() {
        let previous = MapGeometry::new(3, 4, 4);
        let spec = LayerSpec::max_pooling(
            Activation::Identity,
            MapGeometry::new(2, 2, 2),
            Window::new(2, 2),
            Window::new(2, 2),
        );
        assert!(build_graph(&spec, &previous).is_err());
    }

    #[test]
    fn test_incidence_matches_connections() {
        let previous = MapGeometry::new(2, 5, 5);
        let spec =
            LayerSpec::convolutional(Activation::Tanh, MapGeometry::new(3, 5, 5), Window::new(3, 3))
                .with_padding(1, 1);
        let graph = build_graph(&spec, &previous).unwrap();

        assert_eq!(graph.weight_refs.len(), graph.connection_count());
        assert_eq!(
            graph.source_refs.len(),
            graph.connection_count() - graph.connections.len()
        );
        for w in 0..graph.weight_count {
            for &(neuron, slot) in graph.weight_refs.get(w) {
                assert_eq!(graph.connections[neuron][slot].weight, w);
            }
        }
        for p in 0..previous.neuron_count() {
            for &(neuron, slot) in graph.source_refs.get(p) {
                assert_eq!(graph.connections[neuron][slot].source, Source::Neuron(p));
            }
        }
    }

    #[test]
    fn test_random_mapping_is_reproducible() {
        let a = Mapping::random(16, 64, 60, 1488).unwrap();
        let b = Mapping::random(16, 64, 60, 1488).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 16 * 64);
        let dense = Mapping::random(3, 3, 100, 7).unwrap();
        assert_eq!(dense.connected_count(), 9);
        assert!(Mapping::random(0, 3, 50, 1).is_err());
    }

    #[test]
    fn test_layer_spec_from_json() {
        let json = r#"{
            "kind": "convolutional",
            "activation": "tanh",
            "maps": 6, "width": 4, "height": 4,
            "receptive_field": {"x": 3, "y": 3},
            "pad": {"x": 1, "y": 1}
        }"#;
        let spec: LayerSpec = serde_json::from_str(json).unwrap();
        assert_eq!(spec.kind, LayerKind::Convolutional);
        assert_eq!(spec.geometry, MapGeometry::new(6, 4, 4));
        assert_eq!(spec.stride, Window::unit());
        assert!(spec.fully_mapped);

        let dense: LayerSpec =
            serde_json::from_str(r#"{"kind": "fully_connected", "neurons": 10}"#).unwrap();
        assert_eq!(dense.geometry, MapGeometry::new(10, 1, 1));
    }
}
