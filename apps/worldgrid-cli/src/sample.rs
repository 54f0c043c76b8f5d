//! Deterministic synthetic worlds for trying out builds.

use glam::{Quat, Vec3};
use worldgrid_common::hash::splitmix64;
use worldgrid_common::{Aabb, LayerSet, ObjectId, SurfaceHandle, Transform};
use worldgrid_kernel::{ClusterMode, Container, PlacedObjectRecord, World};

const SPACING: f32 = 3200.0;

fn unit(state: &mut u64) -> f32 {
    *state = splitmix64(*state);
    (*state >> 40) as f32 / (1u64 << 24) as f32
}

/// `objects` props on a jittered square layout. Every 10th references its
/// predecessor, every 25th is always loaded, every 40th sits on the
/// "night" layer, and every 50th slot places a three-piece "Camp" container.
pub fn sample_world(name: &str, objects: usize) -> World {
    let mut world = World::new(name);
    let main = world.main.clone();
    let mut camp = Container::new("Camp");
    for i in 0..3u128 {
        let at = Vec3::new(i as f32 * 150.0, 0.0, 0.0);
        camp.register(
            PlacedObjectRecord::new(
                ObjectId::derive(b"camp", &i.to_le_bytes()),
                Aabb::from_center_extent(at, Vec3::splat(60.0)),
            )
            .with_label(format!("camp_piece_{i}"))
            .with_transform(Transform::from_position(at))
            .with_surfaces([SurfaceHandle(900 + i as u64)])
            .with_aggregate_layer("HLOD0"),
        );
    }
    world.add_container(camp);

    let side = (objects as f32).sqrt().ceil().max(1.0) as usize;
    let mut state = 0x5eed_u64;
    let mut previous: Option<ObjectId> = None;
    for i in 0..objects {
        let (gx, gy) = ((i % side) as f32, (i / side) as f32);
        let at = Vec3::new(
            (gx + unit(&mut state) * 0.5) * SPACING,
            (gy + unit(&mut state) * 0.5) * SPACING,
            unit(&mut state) * 200.0,
        );
        let extent = Vec3::splat(50.0 + unit(&mut state) * 400.0);
        let id = ObjectId::derive(name.as_bytes(), &(i as u64).to_le_bytes());
        let transform = Transform {
            position: at,
            rotation: Quat::from_rotation_z(unit(&mut state) * std::f32::consts::TAU),
            scale: Vec3::ONE,
        };

        if i % 50 == 49 {
            world.register(
                &main,
                PlacedObjectRecord::new(id, Aabb::from_center_extent(at, Vec3::splat(300.0)))
                    .with_label(format!("camp_{i}"))
                    .with_transform(transform)
                    .instancing("Camp", ClusterMode::Partitioned),
            );
            continue;
        }

        let mut record = PlacedObjectRecord::new(id, Aabb::from_center_extent(at, extent))
            .with_label(format!("prop_{i}"))
            .with_transform(transform)
            .with_surfaces([SurfaceHandle((i % 7) as u64 + 1)])
            .with_aggregate_layer("HLOD0");
        if i % 10 == 9 {
            record = record.with_references(previous);
        }
        if i % 25 == 24 {
            record = record.always_loaded();
        }
        if i % 40 == 39 {
            record = record.with_layers(LayerSet::from_names(["night"]));
        }
        world.register(&main, record);
        previous = Some(id);
    }
    world
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sample_is_deterministic() {
        let a = sample_world("Sample", 120);
        let b = sample_world("Sample", 120);
        assert_eq!(a.state_hash(), b.state_hash());
        assert_eq!(a.object_count(), b.object_count());
        assert!(a.container("Camp").is_some());
    }

    #[test]
    fn sample_builds() {
        let world = sample_world("Sample", 200);
        let out = worldgrid_hlod::run(
            &world,
            &worldgrid_hlod::BuildSettings::default(),
            &mut worldgrid_hlod::InstancingBaker::new(),
            &mut worldgrid_hlod::MemoryAggregateStore::new(),
            &mut worldgrid_hlod::NoMemoryProbe,
        )
        .unwrap();
        assert_eq!(out.summary.failed_loads, 0);
        assert_eq!(out.summary.instances, 5);
        assert!(out.summary.cells > 1);
    }
}
