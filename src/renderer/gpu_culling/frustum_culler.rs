/// Frustum math shared by the CPU batch prefilter and the software visibility kernel
///
/// Mirrors the plane extraction and p-vertex test in `shaders/visibility.wgsl`.

use glam::{Mat4, Vec3, Vec4};

/// Axis-aligned bounding box
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Aabb {
    pub min: Vec3,
    pub max: Vec3,
}

impl Aabb {
    pub fn new(min: Vec3, max: Vec3) -> Self {
        Self { min, max }
    }

    pub fn from_center_half_extents(center: Vec3, half_extents: Vec3) -> Self {
        Self {
            min: center - half_extents,
            max: center + half_extents,
        }
    }

    pub fn center(&self) -> Vec3 {
        (self.min + self.max) * 0.5
    }

    pub fn half_extents(&self) -> Vec3 {
        (self.max - self.min) * 0.5
    }

    pub fn corners(&self) -> [Vec3; 8] {
        let (a, b) = (self.min, self.max);
        [
            Vec3::new(a.x, a.y, a.z),
            Vec3::new(b.x, a.y, a.z),
            Vec3::new(a.x, b.y, a.z),
            Vec3::new(b.x, b.y, a.z),
            Vec3::new(a.x, a.y, b.z),
            Vec3::new(b.x, a.y, b.z),
            Vec3::new(a.x, b.y, b.z),
            Vec3::new(b.x, b.y, b.z),
        ]
    }

    /// Bounds of this box after an affine transform
    pub fn transformed(&self, transform: &Mat4) -> Self {
        let center = transform.transform_point3(self.center());
        let extents = self.half_extents();
        let abs_x = transform.x_axis.truncate().abs();
        let abs_y = transform.y_axis.truncate().abs();
        let abs_z = transform.z_axis.truncate().abs();
        let world_extents = abs_x * extents.x + abs_y * extents.y + abs_z * extents.z;
        Self::from_center_half_extents(center, world_extents)
    }
}

/// Plane `normal . p + distance = 0`, normal pointing into the frustum
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Plane {
    pub normal: Vec3,
    pub distance: f32,
}

impl Plane {
    fn from_vec4(v: Vec4) -> Self {
        let length = v.truncate().length();
        if length <= f32::EPSILON {
            return Self {
                normal: Vec3::ZERO,
                distance: 0.0,
            };
        }
        Self {
            normal: v.truncate() / length,
            distance: v.w / length,
        }
    }

    pub fn signed_distance(&self, point: Vec3) -> f32 {
        self.normal.dot(point) + self.distance
    }

    pub fn to_array(&self) -> [f32; 4] {
        self.normal.extend(self.distance).to_array()
    }
}

/// Six view-frustum planes: left, right, bottom, top, near, far
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Frustum {
    pub planes: [Plane; 6],
}

impl Frustum {
    /// Gribb-Hartmann extraction for a 0..1 clip-space depth range
    pub fn from_view_projection(view_proj: &Mat4) -> Self {
        let r0 = view_proj.row(0);
        let r1 = view_proj.row(1);
        let r2 = view_proj.row(2);
        let r3 = view_proj.row(3);

        Self {
            planes: [
                Plane::from_vec4(r3 + r0),
                Plane::from_vec4(r3 - r0),
                Plane::from_vec4(r3 + r1),
                Plane::from_vec4(r3 - r1),
                Plane::from_vec4(r2),
                Plane::from_vec4(r3 - r2),
            ],
        }
    }

    /// Conservative box test; `false` only when the box lies fully outside one plane
    pub fn intersects_aabb(&self, aabb: &Aabb) -> bool {
        let center = aabb.center();
        let extents = aabb.half_extents();
        self.planes.iter().all(|plane| {
            let radius = extents.dot(plane.normal.abs());
            plane.signed_distance(center) >= -radius
        })
    }

    pub fn contains_point(&self, point: Vec3) -> bool {
        self.planes.iter().all(|plane| plane.signed_distance(point) >= 0.0)
    }

    pub fn to_arrays(&self) -> [[f32; 4]; 6] {
        self.planes.map(|plane| plane.to_array())
    }

    pub fn from_arrays(planes: &[[f32; 4]; 6]) -> Self {
        Self {
            planes: planes.map(|p| Plane {
                normal: Vec3::new(p[0], p[1], p[2]),
                distance: p[3],
            }),
        }
    }
}
