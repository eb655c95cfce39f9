// vent-core/src/units.rs

use uom::si::f64::{
    Pressure as UomPressure, Ratio as UomRatio, Time as UomTime, Volume as UomVolume,
    VolumeRate as UomVolumeRate,
};

// Public canonical unit types (SI, f64)
pub type Duration = UomTime;
pub type Pressure = UomPressure;
pub type Ratio = UomRatio;
pub type Volume = UomVolume;
pub type VolumeRate = UomVolumeRate;

#[inline]
pub fn secs(v: f64) -> Duration {
    use uom::si::time::second;
    Duration::new::<second>(v)
}

#[inline]
pub fn ms(v: f64) -> Duration {
    use uom::si::time::millisecond;
    Duration::new::<millisecond>(v)
}

#[inline]
pub fn micros(v: f64) -> Duration {
    use uom::si::time::microsecond;
    Duration::new::<microsecond>(v)
}

#[inline]
pub fn cm_h2o(v: f64) -> Pressure {
    use uom::si::pressure::centimeter_of_water;
    Pressure::new::<centimeter_of_water>(v)
}

#[inline]
pub fn kpa(v: f64) -> Pressure {
    use uom::si::pressure::kilopascal;
    Pressure::new::<kilopascal>(v)
}

#[inline]
pub fn ml(v: f64) -> Volume {
    use uom::si::volume::milliliter;
    Volume::new::<milliliter>(v)
}

#[inline]
pub fn ml_per_sec(v: f64) -> VolumeRate {
    use uom::si::volume_rate::cubic_centimeter_per_second;
    VolumeRate::new::<cubic_centimeter_per_second>(v)
}

#[inline]
pub fn liters_per_sec(v: f64) -> VolumeRate {
    use uom::si::volume_rate::liter_per_second;
    VolumeRate::new::<liter_per_second>(v)
}

#[inline]
pub fn liters_per_min(v: f64) -> VolumeRate {
    use uom::si::volume_rate::liter_per_minute;
    VolumeRate::new::<liter_per_minute>(v)
}

#[cfg(test)]
mod tests {
    use super::*;
    use uom::si::pressure::kilopascal;
    use uom::si::volume::milliliter;
    use uom::si::volume_rate::cubic_centimeter_per_second;

    #[test]
    fn constructors_smoke() {
        let _p = cm_h2o(20.0);
        let _v = ml(500.0);
        let _f = ml_per_sec(200.0);
        let _dt = ms(10.0);
    }

    #[test]
    fn cm_h2o_to_kpa() {
        // 1 cmH2O = 98.0665 Pa
        let p = cm_h2o(10.0);
        let k = p.get::<kilopascal>();
        assert!((k - 0.980_665).abs() < 1e-9);
    }

    #[test]
    fn flow_times_time_is_volume() {
        let v = ml_per_sec(500.0) * secs(1.0);
        assert!((v.get::<milliliter>() - 500.0).abs() < 1e-9);
    }

    #[test]
    fn liters_per_sec_is_1000_ml_per_sec() {
        let f = liters_per_sec(1.0);
        assert!((f.get::<cubic_centimeter_per_second>() - 1000.0).abs() < 1e-9);
    }
}
