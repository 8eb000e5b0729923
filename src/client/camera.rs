use crate::util::vec3::Vec3;

/// Fraction of the remaining distance covered each tick
const FOLLOW_FACTOR: f32 = 0.2;

/// Smoothly follows a target position
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Camera {
    pub position: Vec3,
}

impl Camera {
    pub fn new(position: Vec3) -> Self {
        Self { position }
    }

    pub fn follow(&mut self, target: Vec3) {
        self.position = self.position.lerp(target, FOLLOW_FACTOR);
    }

    /// Jump straight to the target, e.g. after a teleport
    pub fn snap_to(&mut self, target: Vec3) {
        self.position = target;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_follow_converges() {
        let target = Vec3::new(100.0, 50.0, 0.0);
        let mut camera = Camera::new(Vec3::default());
        camera.follow(target);
        assert!(camera.position.x > 0.0 && camera.position.x < 100.0);
        for _ in 0..200 {
            camera.follow(target);
        }
        assert!(camera.position.approx_eq(target, 1e-3));
    }
}
